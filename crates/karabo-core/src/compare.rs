//! Change detection between property values.
//!
//! Used to suppress no-op updates: floating point values within a relative
//! tolerance of [`RELATIVE_TOLERANCE`] are considered equal.

use num_complex::{Complex32, Complex64};

use crate::hash::Hash;
use crate::value::Value;

/// Relative tolerance for float comparison.
pub const RELATIVE_TOLERANCE: f64 = 1e-7;

fn close(a: f64, b: f64) -> bool {
    if a == b || (a.is_nan() && b.is_nan()) {
        return true;
    }
    let scale = a.abs().max(b.abs());
    (a - b).abs() <= RELATIVE_TOLERANCE * scale
}

fn close_c32(a: &Complex32, b: &Complex32) -> bool {
    close(f64::from(a.re), f64::from(b.re)) && close(f64::from(a.im), f64::from(b.im))
}

fn close_c64(a: &Complex64, b: &Complex64) -> bool {
    close(a.re, b.re) && close(a.im, b.im)
}

fn slices_close<T>(a: &[T], b: &[T], eq: impl Fn(&T, &T) -> bool) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| eq(x, y))
}

/// True when `new` differs from `old`.
///
/// A change of type always counts as a change.
pub fn has_changes(old: &Value, new: &Value) -> bool {
    match (old, new) {
        (Value::Float(a), Value::Float(b)) => !close(f64::from(*a), f64::from(*b)),
        (Value::Double(a), Value::Double(b)) => !close(*a, *b),
        (Value::ComplexFloat(a), Value::ComplexFloat(b)) => !close_c32(a, b),
        (Value::ComplexDouble(a), Value::ComplexDouble(b)) => !close_c64(a, b),
        (Value::VectorFloat(a), Value::VectorFloat(b)) => {
            !slices_close(a, b, |x, y| close(f64::from(*x), f64::from(*y)))
        }
        (Value::VectorDouble(a), Value::VectorDouble(b)) => !slices_close(a, b, |x, y| close(*x, *y)),
        (Value::VectorComplexFloat(a), Value::VectorComplexFloat(b)) => {
            !slices_close(a, b, close_c32)
        }
        (Value::VectorComplexDouble(a), Value::VectorComplexDouble(b)) => {
            !slices_close(a, b, close_c64)
        }
        (Value::Hash(a), Value::Hash(b)) => hash_has_changes(a, b),
        (Value::VectorHash(a), Value::VectorHash(b)) => {
            !slices_close(a, b, |x, y| !hash_has_changes(x, y))
        }
        (a, b) if a.value_type() != b.value_type() => true,
        (a, b) => a != b,
    }
}

/// Hash-level change detection: key sets and every value.
pub fn hash_has_changes(old: &Hash, new: &Hash) -> bool {
    if old.len() != new.len() {
        return true;
    }
    new.iter().any(|node| match old.get_node(node.key()) {
        Some(prev) => has_changes(prev.value(), node.value()),
        None => true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash;
    use crate::ndarray::NDArray;

    #[test]
    fn float_tolerance() {
        assert!(!has_changes(&Value::Double(1.0), &Value::Double(1.0 + 1e-9)));
        assert!(has_changes(&Value::Double(1.0), &Value::Double(1.001)));
        assert!(!has_changes(&Value::Float(1000.0), &Value::Float(1000.00001)));
        assert!(!has_changes(&Value::Double(0.0), &Value::Double(0.0)));
        assert!(!has_changes(&Value::Double(f64::NAN), &Value::Double(f64::NAN)));
    }

    #[test]
    fn arrays_compare_elementwise() {
        let a = Value::VectorDouble(vec![1.0, 2.0]);
        assert!(!has_changes(&a, &Value::VectorDouble(vec![1.0, 2.0 + 1e-12])));
        assert!(has_changes(&a, &Value::VectorDouble(vec![1.0])));
        let x = Value::NDArray(NDArray::from_slice(&[1i32, 2, 3]));
        let y = Value::NDArray(NDArray::from_slice(&[1i32, 2, 3]));
        assert!(!has_changes(&x, &y));
    }

    #[test]
    fn type_change_is_a_change() {
        assert!(has_changes(&Value::Int32(1), &Value::Int64(1)));
        assert!(has_changes(&Value::None, &Value::Bool(false)));
        assert!(!has_changes(&Value::from("a"), &Value::from("a")));
    }

    #[test]
    fn nested_hashes() {
        let a = hash! { "x" => 1.0f64, "y.z" => "q" };
        let b = hash! { "y.z" => "q", "x" => 1.0f64 + 1e-10 };
        assert!(!hash_has_changes(&a, &b));
        let c = hash! { "x" => 1.0f64, "y.z" => "r" };
        assert!(hash_has_changes(&a, &c));
    }
}
