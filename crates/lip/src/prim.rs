//! Primitive operations.
//!
//! One implementation backs both the inlined arithmetic/comparison opcodes
//! and the native wrappers registered in the root namespace, so error
//! messages and edge cases match no matter how an operator is reached.

use std::cmp::Ordering;

use crate::value::{Value, generic_cmp};

/// Arity error in the exact shape the argument binder uses.
fn bad_argc_exact(expected: usize, got: usize) -> String {
    format!("Bad number of arguments (exactly {expected} expected, got {got})")
}

fn bad_argc_at_least(expected: usize, got: usize) -> String {
    format!("Bad number of arguments (at least {expected} expected, got {got})")
}

fn bad_argc_at_most(expected: usize, got: usize) -> String {
    format!("Bad number of arguments (at most {expected} expected, got {got})")
}

fn number(index: usize, value: &Value) -> Result<f64, String> {
    match value {
        Value::Number(n) => Ok(*n),
        other => Err(format!(
            "Bad argument #{} (number expected, got {})",
            index + 1,
            other.type_name()
        )),
    }
}

/// `+`: sum of all arguments; 0 with none.
pub(crate) fn add(args: &[Value]) -> Result<Value, String> {
    let mut sum = 0.0;
    for (i, arg) in args.iter().enumerate() {
        sum += number(i, arg)?;
    }
    Ok(Value::Number(sum))
}

/// `-`: negation with one argument, subtraction with two.
pub(crate) fn sub(args: &[Value]) -> Result<Value, String> {
    check_one_or_two(args)?;
    let lhs = number(0, &args[0])?;
    if args.len() == 1 {
        Ok(Value::Number(-lhs))
    } else {
        Ok(Value::Number(lhs - number(1, &args[1])?))
    }
}

/// `*`: product of all arguments; 1 with none.
pub(crate) fn mul(args: &[Value]) -> Result<Value, String> {
    let mut product = 1.0;
    for (i, arg) in args.iter().enumerate() {
        product *= number(i, arg)?;
    }
    Ok(Value::Number(product))
}

/// `/`: reciprocal with one argument, division with two.
pub(crate) fn fdiv(args: &[Value]) -> Result<Value, String> {
    check_one_or_two(args)?;
    let lhs = number(0, &args[0])?;
    if args.len() == 1 {
        Ok(Value::Number(1.0 / lhs))
    } else {
        Ok(Value::Number(lhs / number(1, &args[1])?))
    }
}

fn check_one_or_two(args: &[Value]) -> Result<(), String> {
    if args.is_empty() {
        return Err(bad_argc_at_least(1, 0));
    }
    if args.len() > 2 {
        return Err(bad_argc_at_most(2, args.len()));
    }
    Ok(())
}

/// `!`: whether the single argument is falsy.
pub(crate) fn not(args: &[Value]) -> Result<Value, String> {
    if args.len() != 1 {
        return Err(bad_argc_exact(1, args.len()));
    }
    Ok(Value::Boolean(args[0].is_falsy()))
}

/// `cmp`: sign of the generic comparison.
pub(crate) fn cmp(args: &[Value]) -> Result<Value, String> {
    let ordering = compare(args)?;
    Ok(Value::Number(match ordering {
        Ordering::Less => -1.0,
        Ordering::Equal => 0.0,
        Ordering::Greater => 1.0,
    }))
}

fn compare(args: &[Value]) -> Result<Ordering, String> {
    if args.len() != 2 {
        return Err(bad_argc_exact(2, args.len()));
    }
    Ok(generic_cmp(&args[0], &args[1]))
}

/// `==`
pub(crate) fn eq(args: &[Value]) -> Result<Value, String> {
    Ok(Value::Boolean(compare(args)? == Ordering::Equal))
}

/// `!=`
pub(crate) fn neq(args: &[Value]) -> Result<Value, String> {
    Ok(Value::Boolean(compare(args)? != Ordering::Equal))
}

/// `>`
pub(crate) fn gt(args: &[Value]) -> Result<Value, String> {
    Ok(Value::Boolean(compare(args)? == Ordering::Greater))
}

/// `<`
pub(crate) fn lt(args: &[Value]) -> Result<Value, String> {
    Ok(Value::Boolean(compare(args)? == Ordering::Less))
}

/// `>=`
pub(crate) fn gte(args: &[Value]) -> Result<Value, String> {
    Ok(Value::Boolean(compare(args)? != Ordering::Less))
}

/// `<=`
pub(crate) fn lte(args: &[Value]) -> Result<Value, String> {
    Ok(Value::Boolean(compare(args)? != Ordering::Greater))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nums(values: &[f64]) -> Vec<Value> {
        values.iter().map(|&n| Value::Number(n)).collect()
    }

    #[test]
    fn add_is_variadic() {
        assert_eq!(add(&[]), Ok(Value::Number(0.0)));
        assert_eq!(add(&nums(&[1.0, 2.0, 3.5])), Ok(Value::Number(6.5)));
    }

    #[test]
    fn sub_negates_or_subtracts() {
        assert_eq!(sub(&nums(&[4.0])), Ok(Value::Number(-4.0)));
        assert_eq!(sub(&nums(&[4.0, 1.5])), Ok(Value::Number(2.5)));
        assert_eq!(
            sub(&[]),
            Err("Bad number of arguments (at least 1 expected, got 0)".to_owned())
        );
        assert_eq!(
            sub(&nums(&[1.0, 2.0, 3.0])),
            Err("Bad number of arguments (at most 2 expected, got 3)".to_owned())
        );
    }

    #[test]
    fn mul_is_variadic_with_identity_one() {
        assert_eq!(mul(&[]), Ok(Value::Number(1.0)));
        assert_eq!(mul(&nums(&[2.0, 3.0, 4.0])), Ok(Value::Number(24.0)));
    }

    #[test]
    fn fdiv_takes_reciprocal_or_divides() {
        assert_eq!(fdiv(&nums(&[4.0])), Ok(Value::Number(0.25)));
        assert_eq!(fdiv(&nums(&[9.0, 3.0])), Ok(Value::Number(3.0)));
    }

    #[test]
    fn type_errors_name_the_argument() {
        assert_eq!(
            add(&[Value::Number(1.0), Value::string("x")]),
            Err("Bad argument #2 (number expected, got string)".to_owned())
        );
    }

    #[test]
    fn not_tests_falsiness() {
        assert_eq!(not(&[Value::Nil]), Ok(Value::Boolean(true)));
        assert_eq!(not(&[Value::Boolean(false)]), Ok(Value::Boolean(true)));
        assert_eq!(not(&[Value::Number(0.0)]), Ok(Value::Boolean(false)));
    }

    #[test]
    fn cmp_returns_sign() {
        assert_eq!(
            cmp(&nums(&[1.0, 2.0])),
            Ok(Value::Number(-1.0))
        );
        assert_eq!(cmp(&nums(&[2.0, 2.0])), Ok(Value::Number(0.0)));
        assert_eq!(cmp(&nums(&[3.0, 2.0])), Ok(Value::Number(1.0)));
    }

    #[test]
    fn comparisons_are_generic() {
        assert_eq!(
            eq(&[Value::string("a"), Value::string("a")]),
            Ok(Value::Boolean(true))
        );
        assert_eq!(
            lt(&[Value::string("a"), Value::string("b")]),
            Ok(Value::Boolean(true))
        );
        assert_eq!(
            neq(&[Value::Nil, Value::Number(0.0)]),
            Ok(Value::Boolean(true))
        );
        assert_eq!(
            gte(&nums(&[2.0, 2.0])),
            Ok(Value::Boolean(true))
        );
        assert_eq!(
            lte(&nums(&[3.0, 2.0])),
            Ok(Value::Boolean(false))
        );
        assert_eq!(
            gt(&nums(&[3.0, 2.0])),
            Ok(Value::Boolean(true))
        );
    }
}
