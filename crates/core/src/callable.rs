//! Tagged callables bound to variables

use sensd_types::{ArgKind, Value};
use std::fmt;
use std::sync::Arc;

/// A variable's resolved method, tagged by the argument it expects
///
/// Cloning is cheap: every variant shares the underlying function, which
/// lets the scheduler evaluate outside the state lock.
#[derive(Clone)]
pub enum Callable {
    NoArg(Arc<dyn Fn() -> Value + Send + Sync>),
    Str(Arc<dyn Fn(&str) -> Value + Send + Sync>),
    Int(Arc<dyn Fn(i64) -> Value + Send + Sync>),
    Dbl(Arc<dyn Fn(f64) -> Value + Send + Sync>),
}

impl Callable {
    pub fn no_arg(f: impl Fn() -> Value + Send + Sync + 'static) -> Self {
        Callable::NoArg(Arc::new(f))
    }

    pub fn with_str(f: impl Fn(&str) -> Value + Send + Sync + 'static) -> Self {
        Callable::Str(Arc::new(f))
    }

    pub fn with_int(f: impl Fn(i64) -> Value + Send + Sync + 'static) -> Self {
        Callable::Int(Arc::new(f))
    }

    pub fn with_dbl(f: impl Fn(f64) -> Value + Send + Sync + 'static) -> Self {
        Callable::Dbl(Arc::new(f))
    }

    pub fn arg_kind(&self) -> ArgKind {
        match self {
            Callable::NoArg(_) => ArgKind::None,
            Callable::Str(_) => ArgKind::Str,
            Callable::Int(_) => ArgKind::Int,
            Callable::Dbl(_) => ArgKind::Double,
        }
    }

    /// Invoke with a subscription's raw argument, coerced to the expected kind
    ///
    /// A missing or unparsable numeric argument is passed as -1 / -1.0, a
    /// missing string argument as the empty string.
    pub fn invoke(&self, arg: Option<&str>) -> Value {
        match self {
            Callable::NoArg(f) => f(),
            Callable::Str(f) => f(arg.unwrap_or("")),
            Callable::Int(f) => {
                let value = arg.and_then(|a| a.trim().parse::<i64>().ok()).unwrap_or(-1);
                f(value)
            }
            Callable::Dbl(f) => {
                let value = arg.and_then(|a| a.trim().parse::<f64>().ok()).unwrap_or(-1.0);
                f(value)
            }
        }
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Callable::{:?}", self.arg_kind())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_numeric_argument_uses_sentinel() {
        let int = Callable::with_int(|n| Value::text(n.to_string()));
        assert_eq!(int.invoke(None), Value::text("-1"));
        assert_eq!(int.invoke(Some("not a number")), Value::text("-1"));
        assert_eq!(int.invoke(Some(" 3 ")), Value::text("3"));

        let dbl = Callable::with_dbl(|d| Value::text(format!("{:.1}", d)));
        assert_eq!(dbl.invoke(None), Value::text("-1.0"));
        assert_eq!(dbl.invoke(Some("2.5")), Value::text("2.5"));
    }

    #[test]
    fn test_string_argument_passthrough() {
        let callable = Callable::with_str(|s| Value::text(format!("[{}]", s)));
        assert_eq!(callable.invoke(Some("BAT0")), Value::text("[BAT0]"));
        assert_eq!(callable.invoke(None), Value::text("[]"));
    }

    #[test]
    fn test_no_arg_ignores_argument() {
        let callable = Callable::no_arg(|| Value::Level(42));
        assert_eq!(callable.invoke(Some("ignored")), Value::Level(42));
        assert_eq!(callable.arg_kind(), ArgKind::None);
    }
}
