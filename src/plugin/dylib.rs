//! Shared-library module loader

use libloading::Library;
use log::debug;
use sensd_core::{
    ArgKind, BoxedModule, Callable, LoadError, ModuleLoader, ProviderModule, Registrar,
    ResolveError, Value, VarType, PLUGIN_EXTENSION,
};
use sensd_types::abi::{
    InitFn, LevelDblFn, LevelFn, LevelIntFn, LevelStrFn, NameFn, RawRegistrar, TeardownFn,
    TextDblFn, TextFn, TextIntFn, TextStrFn, INIT_SYMBOL, NAME_SYMBOL, TEARDOWN_SYMBOL,
    TEXT_BUFFER_LEN,
};
use std::ffi::{c_char, c_void, CStr, CString};
use std::path::Path;
use std::sync::Arc;

/// Opens provider modules built as shared libraries
#[derive(Debug, Default, Clone, Copy)]
pub struct DylibLoader;

impl ModuleLoader for DylibLoader {
    fn accepts(&self, path: &Path) -> bool {
        path.extension().is_some_and(|ext| ext == PLUGIN_EXTENSION)
    }

    fn open(&self, path: &Path) -> Result<BoxedModule, LoadError> {
        // SAFETY: loading runs the library's initializers; modules in the
        // plugin directory are trusted code
        let library = unsafe { Library::new(path) }.map_err(|e| LoadError::Open {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let mut missing = Vec::new();
        for (symbol, label) in [
            (NAME_SYMBOL, "sensd_module_name"),
            (INIT_SYMBOL, "sensd_module_init"),
            (TEARDOWN_SYMBOL, "sensd_module_teardown"),
        ] {
            // SAFETY: only checks presence, the pointer is not used
            if unsafe { library.get::<*const c_void>(symbol) }.is_err() {
                missing.push(label);
            }
        }
        if !missing.is_empty() {
            return Err(LoadError::MissingSymbols {
                path: path.to_path_buf(),
                missing,
            });
        }

        let open_err = |e: libloading::Error| LoadError::Open {
            path: path.to_path_buf(),
            reason: e.to_string(),
        };
        // SAFETY: the symbols were found above and their types are fixed by
        // the module ABI. The copied function pointers never outlive
        // `library`, which the module keeps alive.
        let (name_fn, init, teardown) = unsafe {
            (
                *library.get::<NameFn>(NAME_SYMBOL).map_err(open_err)?,
                *library.get::<InitFn>(INIT_SYMBOL).map_err(open_err)?,
                *library.get::<TeardownFn>(TEARDOWN_SYMBOL).map_err(open_err)?,
            )
        };

        // SAFETY: the ABI requires a NUL-terminated name valid while loaded
        let raw_name = unsafe { name_fn() };
        if raw_name.is_null() {
            return Err(LoadError::Open {
                path: path.to_path_buf(),
                reason: "module name is null".to_string(),
            });
        }
        let name = unsafe { CStr::from_ptr(raw_name) }
            .to_string_lossy()
            .into_owned();
        debug!("Opened native module {} from {}", name, path.display());

        Ok(Box::new(DylibModule {
            name,
            library: Arc::new(library),
            init,
            teardown,
        }))
    }
}

/// A provider module living in a shared library
struct DylibModule {
    name: String,
    /// Shared with every resolved callable so the code stays mapped
    library: Arc<Library>,
    init: InitFn,
    teardown: TeardownFn,
}

/// What `RawRegistrar::ctx` points at during init
struct Bridge<'a> {
    registrar: &'a mut dyn Registrar,
}

unsafe extern "C" fn register_trampoline(
    ctx: *mut c_void,
    name: *const c_char,
    method: *const c_char,
    default_timeout: u32,
    var_type: u32,
) -> bool {
    if ctx.is_null() || name.is_null() || method.is_null() {
        return false;
    }
    let bridge = &mut *ctx.cast::<Bridge<'_>>();
    let name = CStr::from_ptr(name).to_string_lossy();
    let method = CStr::from_ptr(method).to_string_lossy();
    bridge
        .registrar
        .register_variable(&name, &method, default_timeout, VarType::from_bits(var_type))
}

impl DylibModule {
    fn symbol<T: Copy>(&self, symbol: &CString, method: &str) -> Result<T, ResolveError> {
        // SAFETY: the caller picks `T` from the variable's type tag, which is
        // the signature the module ABI prescribes for it
        unsafe { self.library.get::<T>(symbol.as_bytes_with_nul()) }
            .map(|f| *f)
            .map_err(|_| ResolveError::UnknownMethod {
                module: self.name.clone(),
                method: method.to_string(),
            })
    }
}

impl ProviderModule for DylibModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&self, registrar: &mut dyn Registrar) -> anyhow::Result<()> {
        let mut bridge = Bridge { registrar };
        let mut raw = RawRegistrar {
            ctx: (&mut bridge as *mut Bridge<'_>).cast::<c_void>(),
            register: register_trampoline,
        };
        // SAFETY: `raw` and `bridge` outlive the call; the module must not
        // keep the registrar after init returns
        let status = unsafe { (self.init)(&mut raw) };
        if status != 0 {
            anyhow::bail!("init entry point returned {}", status);
        }
        Ok(())
    }

    fn resolve(&self, method: &str, var_type: VarType) -> Result<Callable, ResolveError> {
        let symbol =
            CString::new(method).map_err(|_| ResolveError::InvalidName(method.to_string()))?;
        let lib = self.library.clone();

        let callable = if var_type.kind().is_level() {
            match var_type.arg_kind() {
                ArgKind::None => {
                    let f: LevelFn = self.symbol(&symbol, method)?;
                    Callable::no_arg(move || {
                        let _lib = &lib;
                        Value::level(i64::from(unsafe { f() }))
                    })
                }
                ArgKind::Str => {
                    let f: LevelStrFn = self.symbol(&symbol, method)?;
                    Callable::with_str(move |arg| {
                        let _lib = &lib;
                        let arg = c_arg(arg);
                        Value::level(i64::from(unsafe { f(arg.as_ptr()) }))
                    })
                }
                ArgKind::Int => {
                    let f: LevelIntFn = self.symbol(&symbol, method)?;
                    Callable::with_int(move |arg| {
                        let _lib = &lib;
                        Value::level(i64::from(unsafe { f(arg) }))
                    })
                }
                ArgKind::Double => {
                    let f: LevelDblFn = self.symbol(&symbol, method)?;
                    Callable::with_dbl(move |arg| {
                        let _lib = &lib;
                        Value::level(i64::from(unsafe { f(arg) }))
                    })
                }
            }
        } else {
            match var_type.arg_kind() {
                ArgKind::None => {
                    let f: TextFn = self.symbol(&symbol, method)?;
                    Callable::no_arg(move || {
                        let _lib = &lib;
                        read_text(|out, cap| unsafe { f(out, cap) })
                    })
                }
                ArgKind::Str => {
                    let f: TextStrFn = self.symbol(&symbol, method)?;
                    Callable::with_str(move |arg| {
                        let _lib = &lib;
                        let arg = c_arg(arg);
                        read_text(|out, cap| unsafe { f(arg.as_ptr(), out, cap) })
                    })
                }
                ArgKind::Int => {
                    let f: TextIntFn = self.symbol(&symbol, method)?;
                    Callable::with_int(move |arg| {
                        let _lib = &lib;
                        read_text(|out, cap| unsafe { f(arg, out, cap) })
                    })
                }
                ArgKind::Double => {
                    let f: TextDblFn = self.symbol(&symbol, method)?;
                    Callable::with_dbl(move |arg| {
                        let _lib = &lib;
                        read_text(|out, cap| unsafe { f(arg, out, cap) })
                    })
                }
            }
        };
        Ok(callable)
    }

    fn teardown(&self) {
        // SAFETY: called once, while the library is still loaded
        unsafe { (self.teardown)() }
    }
}

/// Argument for a C string parameter; text after an interior NUL is cut
fn c_arg(arg: &str) -> CString {
    let head = arg.split('\0').next().unwrap_or_default();
    CString::new(head).unwrap_or_default()
}

/// Call a text function with a fresh buffer and decode what it wrote
fn read_text(fill: impl FnOnce(*mut c_char, usize) -> usize) -> Value {
    let mut buf = [0u8; TEXT_BUFFER_LEN];
    let written = fill(buf.as_mut_ptr().cast::<c_char>(), buf.len()).min(buf.len());
    let end = buf[..written].iter().position(|&b| b == 0).unwrap_or(written);
    Value::text(String::from_utf8_lossy(&buf[..end]).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::core::{AcceptAll, ModuleRegistry, VariableDirectory};
    use sensd_types::abi::write_text;
    use std::io::Write;
    use std::path::PathBuf;
    use std::process::Command;

    const FIXTURE_SOURCE: &str =
        concat!(env!("CARGO_MANIFEST_DIR"), "/src/plugin/testdata/fixture_module.rs");

    /// Compile the fixture module into `dir` as a shared library
    fn build_fixture(dir: &Path, crate_name: &str, cfgs: &[&str]) -> PathBuf {
        let out = dir.join(format!("lib{}.{}", crate_name, PLUGIN_EXTENSION));
        let rustc = std::env::var("RUSTC").unwrap_or_else(|_| "rustc".to_string());
        let mut cmd = Command::new(rustc);
        cmd.args(["--crate-type", "cdylib", "--edition", "2021", "--crate-name", crate_name])
            .arg("-o")
            .arg(&out)
            .arg(FIXTURE_SOURCE);
        for cfg in cfgs {
            cmd.args(["--cfg", cfg]);
        }
        let status = cmd.status().unwrap();
        assert!(status.success(), "fixture module failed to build");
        out
    }

    /// Accepts every offer except the teardown counter
    #[derive(Default)]
    struct Collect {
        offers: Vec<(String, String, u32, VarType)>,
    }

    impl Registrar for Collect {
        fn register_variable(
            &mut self,
            name: &str,
            method: &str,
            default_timeout: u32,
            var_type: VarType,
        ) -> bool {
            self.offers
                .push((name.to_string(), method.to_string(), default_timeout, var_type));
            name != "fx_teardowns"
        }
    }

    #[test]
    fn test_accepts_platform_extension() {
        let loader = DylibLoader;
        let name = format!("libbattery.{}", PLUGIN_EXTENSION);
        assert!(loader.accepts(Path::new(&name)));
        assert!(!loader.accepts(Path::new("battery.txt")));
        assert!(!loader.accepts(Path::new("battery")));
    }

    #[test]
    fn test_open_rejects_non_library() {
        let mut file = tempfile::Builder::new()
            .suffix(&format!(".{}", PLUGIN_EXTENSION))
            .tempfile()
            .unwrap();
        file.write_all(b"not a shared object").unwrap();
        assert!(matches!(
            DylibLoader.open(file.path()),
            Err(LoadError::Open { .. })
        ));
    }

    #[test]
    fn test_read_text_stops_at_nul() {
        let value = read_text(|out, cap| unsafe { write_text(out, cap, "42%\0junk") });
        assert_eq!(value, Value::text("42%"));
    }

    #[test]
    fn test_read_text_clamps_bogus_length() {
        let value = read_text(|out, cap| unsafe { write_text(out, cap, "ok") + 10_000 });
        assert_eq!(value, Value::text("ok"));
    }

    #[test]
    fn test_c_arg_truncates_at_nul() {
        assert_eq!(c_arg("BAT0\0rest").as_bytes(), b"BAT0");
        assert_eq!(c_arg("").as_bytes(), b"");
    }

    #[test]
    fn test_native_module_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = build_fixture(dir.path(), "fixture", &[]);
        let module = DylibLoader.open(&path).unwrap();
        assert_eq!(module.name(), "fixture");

        let mut collect = Collect::default();
        module.init(&mut collect).unwrap();
        let offered: Vec<(&str, u32, VarType)> = collect
            .offers
            .iter()
            .map(|(name, _, timeout, ty)| (name.as_str(), *timeout, *ty))
            .collect();
        assert_eq!(
            offered,
            vec![
                ("fx_text", 1, VarType::VARIABLE_STR),
                ("fx_echo", 2, VarType::VARIABLE_STR | VarType::ARG_STR),
                ("fx_double", 3, VarType::VARIABLE_BAR | VarType::ARG_INT),
                ("fx_teardowns", 4, VarType::VARIABLE_BAR),
            ]
        );
        assert_eq!(collect.offers[1].1, "fx_echo_impl");
        // The registrar's answers reach the module
        let accepted = module.resolve("fx_accepted_impl", VarType::VARIABLE_BAR).unwrap();
        assert_eq!(accepted.invoke(None), Value::level(3));

        let text = module.resolve("fx_text_impl", VarType::VARIABLE_STR).unwrap();
        assert_eq!(text.invoke(None), Value::text("42%"));
        let echo = module
            .resolve("fx_echo_impl", VarType::VARIABLE_STR | VarType::ARG_STR)
            .unwrap();
        assert_eq!(echo.invoke(Some("BAT0")), Value::text("BAT0"));
        let double = module
            .resolve("fx_double_impl", VarType::VARIABLE_BAR | VarType::ARG_INT)
            .unwrap();
        assert_eq!(double.invoke(Some("21")), Value::level(42));
        assert!(matches!(
            module.resolve("fx_nowhere", VarType::VARIABLE_STR),
            Err(ResolveError::UnknownMethod { .. })
        ));

        let teardowns = module.resolve("fx_teardowns_impl", VarType::VARIABLE_BAR).unwrap();
        assert_eq!(teardowns.invoke(None), Value::level(0));
        module.teardown();
        assert_eq!(teardowns.invoke(None), Value::level(1));

        // Resolved callables keep the library mapped
        drop(module);
        assert_eq!(text.invoke(None), Value::text("42%"));
    }

    #[test]
    fn test_missing_entry_point_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = build_fixture(dir.path(), "fixture_partial", &["without_teardown"]);
        match DylibLoader.open(&path) {
            Err(LoadError::MissingSymbols { missing, .. }) => {
                assert_eq!(missing, vec!["sensd_module_teardown"]);
            }
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("library without teardown was accepted"),
        }
    }

    #[test]
    fn test_registry_loads_native_modules() {
        let dir = tempfile::tempdir().unwrap();
        build_fixture(dir.path(), "fixture_full", &[]);
        build_fixture(dir.path(), "fixture_partial", &["without_teardown"]);

        let mut registry = ModuleRegistry::new(
            Arc::new(DylibLoader),
            Arc::new(AcceptAll),
            Arc::new(Settings::default()),
        );
        let mut directory = VariableDirectory::new();
        assert_eq!(registry.load_all(dir.path(), &mut directory), 1);

        let id = registry.find_by_name("FIXTURE").unwrap();
        assert_eq!(registry.get(id).unwrap().variables().len(), 4);
        let echo = directory.find_by_name("fx_echo").unwrap();
        let unit = registry.get(id).unwrap().unit();
        let callable = directory
            .resolve_symbol(echo, |method, ty| unit.resolve(method, ty))
            .unwrap();
        assert_eq!(callable.invoke(Some("AC")), Value::text("AC"));

        registry.unload(id, &mut directory);
        assert!(directory.is_empty());
    }
}
