//! Closed-form reduction of the small arithmetic expressions obfuscators use
//! to hide array offsets and character codes (`chr(50+51)`, `min(7,3)`).
//!
//! This is deliberately not an expression grammar. Each step rewrites the
//! leftmost `a OP b` for the first operator found in the order `*`, `/`,
//! `-`, `+`, then recurses on the result.

use once_cell::sync::Lazy;
use regex::Regex;

/// Recursion bound for [`calc`]; past it the result is an empty string.
pub const MAX_CALC_DEPTH: usize = 256;

static MIN_MAX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(min|max)?\(([^)]+)\)").expect("valid min/max regex"));

static TERM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([\d.]+)([*/+-])?").expect("valid term regex"));

const OPERATOR_ORDER: [char; 4] = ['*', '/', '-', '+'];

/// Reduce `expr` to a number rendered as text.
///
/// Anything that cannot be reduced further is returned as-is.
pub fn calc(expr: &str) -> String {
    calc_at(expr, 0)
}

fn calc_at(expr: &str, depth: usize) -> String {
    if depth > MAX_CALC_DEPTH {
        return String::new();
    }

    if let Some(result) = min_max(expr) {
        return result;
    }

    match calc_step(expr) {
        Some(next) => calc_at(&next, depth + 1),
        None => expr.to_string(),
    }
}

/// Evaluate a `min(...)`/`max(...)` call over a comma list.
fn min_max(expr: &str) -> Option<String> {
    let caps = MIN_MAX.captures(expr)?;
    let func = caps.get(1)?;
    let values: Vec<f64> = caps[2].split(',').filter_map(parse_number).collect();
    if values.is_empty() {
        return None;
    }
    let result = if func.as_str().eq_ignore_ascii_case("min") {
        values.into_iter().fold(f64::INFINITY, f64::min)
    } else {
        values.into_iter().fold(f64::NEG_INFINITY, f64::max)
    };
    Some(format_number(result))
}

/// Apply exactly one substitution. `None` when no operator is left or the
/// operands cannot be evaluated.
pub fn calc_step(expr: &str) -> Option<String> {
    let terms: Vec<regex::Captures> = TERM.captures_iter(expr).collect();

    for op in OPERATOR_ORDER {
        let Some(pos) = terms
            .iter()
            .position(|t| t.get(2).and_then(|m| m.as_str().chars().next()) == Some(op))
        else {
            continue;
        };

        let lhs = terms[pos].get(1)?;
        let rhs = terms.get(pos + 1)?.get(1)?;
        let a = parse_number(lhs.as_str())?;
        let b = parse_number(rhs.as_str())?;

        let value = match op {
            '*' => a * b,
            '/' if b == 0.0 => return None,
            '/' => a / b,
            '-' => a - b,
            _ => a + b,
        };

        let mut reduced = String::with_capacity(expr.len());
        reduced.push_str(&expr[..lhs.start()]);
        reduced.push_str(&format_number(value));
        reduced.push_str(&expr[rhs.end()..]);
        return Some(reduced);
    }

    None
}

fn parse_number(text: &str) -> Option<f64> {
    text.trim().parse::<f64>().ok()
}

/// Render like PHP's float-to-string: integral values without a fraction.
pub fn format_number(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multiplication_first() {
        assert_eq!(calc_step("2*3+4"), Some("6+4".to_string()));
        assert_eq!(calc("2*3+4"), "10");
    }

    #[test]
    fn test_operator_order_is_fixed() {
        // Subtraction is reduced before addition, leftmost first
        assert_eq!(calc_step("10+4-2"), Some("10+2".to_string()));
        assert_eq!(calc("10+4-2"), "12");
        // Division before subtraction
        assert_eq!(calc("9-6/3"), "7");
    }

    #[test]
    fn test_min_max() {
        assert_eq!(calc("min(7,3,9)"), "3");
        assert_eq!(calc("max(7, 3, 9)"), "9");
    }

    #[test]
    fn test_fractions() {
        assert_eq!(calc("7/2"), "3.5");
        assert_eq!(calc("0.5*4"), "2");
    }

    #[test]
    fn test_irreducible_input_unchanged() {
        assert_eq!(calc("101"), "101");
        assert_eq!(calc("abc"), "abc");
        assert_eq!(calc("4/0"), "4/0");
    }

    #[test]
    fn test_depth_guard() {
        let long_chain = vec!["1"; MAX_CALC_DEPTH + 10].join("+");
        assert_eq!(calc(&long_chain), "");
    }
}
