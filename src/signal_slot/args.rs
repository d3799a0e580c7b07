//! Positional slot arguments.

use karabo_core::{FromValue, Hash, Value};

use crate::error::{KaraboError, KaraboResult};

/// Ordered argument list of a signal, slot call or reply.
///
/// On the wire the arguments become the message body `{a1: .., a2: .., ...}`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args(Vec<Value>);

impl Args {
    /// No arguments.
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Append one argument.
    #[must_use]
    pub fn push(mut self, value: impl Into<Value>) -> Self {
        self.0.push(value.into());
        self
    }

    /// Number of arguments.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True without arguments.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Argument `index` (0-based).
    pub fn value(&self, index: usize) -> KaraboResult<&Value> {
        self.0.get(index).ok_or_else(|| {
            KaraboError::MalformedMessage(format!(
                "expected at least {} argument(s), got {}",
                index + 1,
                self.0.len()
            ))
        })
    }

    /// Argument `index`, converted to `T` if the stored type differs.
    pub fn get<T: FromValue>(&self, index: usize) -> KaraboResult<T> {
        let value = self.value(index)?;
        if let Some(v) = T::from_value(value) {
            return Ok(v);
        }
        let cast = value.cast(T::VALUE_TYPE)?;
        T::from_value(&cast).ok_or_else(|| {
            KaraboError::MalformedMessage(format!(
                "argument {} is {}, expected {}",
                index + 1,
                value.value_type().name(),
                T::VALUE_TYPE.name()
            ))
        })
    }

    /// Argument `index`, or `default` when absent or unconvertible.
    pub fn get_or<T: FromValue>(&self, index: usize, default: T) -> T {
        self.get(index).unwrap_or(default)
    }

    /// Message body form.
    pub fn to_body(&self) -> Hash {
        let mut body = Hash::new();
        for (i, value) in self.0.iter().enumerate() {
            body.set(&format!("a{}", i + 1), value.clone());
        }
        body
    }

    /// Rebuild from a message body; stops at the first missing `aN`.
    pub fn from_body(body: &Hash) -> Self {
        let mut values = Vec::new();
        while let Ok(v) = body.get_value(&format!("a{}", values.len() + 1)) {
            values.push(v.clone());
        }
        Self(values)
    }

    /// Consume into the raw values.
    pub fn into_values(self) -> Vec<Value> {
        self.0
    }
}

impl From<Vec<Value>> for Args {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}

/// Build [`Args`] from expressions convertible into [`Value`].
///
/// ```
/// use karabo::args;
/// let a = args!["motor", 1.5f64];
/// assert_eq!(a.len(), 2);
/// ```
#[macro_export]
macro_rules! args {
    () => { $crate::signal_slot::Args::new() };
    ($($value:expr),+ $(,)?) => {
        $crate::signal_slot::Args::new()$(.push($value))+
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_round_trip_and_conversion() {
        let a = Args::new().push("x").push(5i32).push(true);
        let body = a.to_body();
        assert_eq!(body.keys(), vec!["a1", "a2", "a3"]);
        let back = Args::from_body(&body);
        assert_eq!(back, a);
        assert_eq!(back.get::<String>(0).unwrap(), "x");
        assert_eq!(back.get::<i64>(1).unwrap(), 5);
        assert!(back.get::<i32>(3).is_err());
        assert_eq!(back.get_or::<i32>(7, 9), 9);
    }

    #[test]
    fn macro_builds_args() {
        let a = crate::args!["a", 2u32];
        assert_eq!(a.get::<u32>(1).unwrap(), 2);
        assert!(crate::args![].is_empty());
    }
}
