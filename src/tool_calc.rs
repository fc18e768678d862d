//! Arithmetic tool: a restricted-grammar expression evaluator.
//!
//! Supports the whitelisted binary operators `+ - * / % ^`, unary minus,
//! a fixed function set (trigonometric, logarithmic, rounding), the named
//! constants `pi`, `e`, and `tau`, and caller-supplied variable
//! substitution. Evaluation may be followed by a unit-conversion step
//! (scalar-factor table plus formula-based temperature entries) and an
//! optional rounding step; every applied stage appends to a human-readable
//! trace.
//!
//! The grammar is closed: no method calls, no assignment, no string
//! handling. Anything outside it is a parse error, returned as `Err` and
//! converted to an error payload at the executor boundary.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;

use crate::tool::{Tool, ToolExample};

/// Built-in arithmetic capability. Registered under `"calculator"`.
pub struct CalculatorTool;

impl CalculatorTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CalculatorTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for CalculatorTool {
    fn name(&self) -> &str {
        "calculator"
    }

    fn description(&self) -> &str {
        "Evaluate arithmetic expressions, with optional unit conversion and rounding"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "expression": { "type": "string", "description": "Arithmetic expression" },
                "variables": { "type": "object", "description": "Name → numeric value substitutions" },
                "convert": {
                    "type": "object",
                    "properties": {
                        "from": { "type": "string" },
                        "to": { "type": "string" }
                    },
                    "required": ["from", "to"]
                },
                "round": { "type": "integer", "description": "Round to N decimal places" }
            },
            "required": ["expression"]
        })
    }

    fn output_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "expression": { "type": "string" },
                "result": { "type": "number" },
                "unit": { "type": "string" },
                "trace": { "type": "array", "items": { "type": "string" } }
            },
            "required": ["expression", "result", "trace"]
        })
    }

    fn examples(&self) -> Vec<ToolExample> {
        vec![
            ToolExample {
                description: "Operator precedence".to_string(),
                input: json!({"expression": "2 + 3 * 4"}),
                output: json!({"expression": "2 + 3 * 4", "result": 14.0}),
            },
            ToolExample {
                description: "Unit conversion with rounding".to_string(),
                input: json!({"expression": "100", "convert": {"from": "km", "to": "mi"}, "round": 4}),
                output: json!({"expression": "100", "result": 62.1371, "unit": "mi"}),
            },
        ]
    }

    async fn execute(&self, input: &Value) -> Result<Value> {
        let Some(expression) = input.get("expression").and_then(|v| v.as_str()) else {
            bail!("calculator requires an 'expression' string input");
        };

        let mut variables = HashMap::new();
        if let Some(vars) = input.get("variables").and_then(|v| v.as_object()) {
            for (name, value) in vars {
                let Some(number) = value.as_f64() else {
                    bail!("variable '{}' is not numeric", name);
                };
                variables.insert(name.to_lowercase(), number);
            }
        }

        let mut trace = Vec::new();
        for (name, value) in &variables {
            trace.push(format!("substituted {} = {}", name, value));
        }

        let mut result = evaluate(expression, &variables)?;
        trace.push(format!("evaluated '{}' = {}", expression.trim(), result));

        let mut unit = None;
        if let Some(convert) = input.get("convert") {
            let from = convert.get("from").and_then(|v| v.as_str()).unwrap_or("");
            let to = convert.get("to").and_then(|v| v.as_str()).unwrap_or("");
            if from.is_empty() || to.is_empty() {
                bail!("convert requires 'from' and 'to' unit names");
            }
            let converted = convert_unit(result, from, to)?;
            trace.push(format!("converted {} {} -> {} {}", result, from, converted, to));
            result = converted;
            unit = Some(to.to_string());
        }

        if let Some(places) = input.get("round").and_then(|v| v.as_i64()) {
            if !(0..=12).contains(&places) {
                bail!("round must be between 0 and 12 decimal places");
            }
            let factor = 10f64.powi(places as i32);
            result = (result * factor).round() / factor;
            trace.push(format!("rounded to {} decimal places: {}", places, result));
        }

        let mut output = json!({
            "expression": expression,
            "result": result,
            "trace": trace,
        });
        if let Some(unit) = unit {
            output["unit"] = unit.into();
        }
        Ok(output)
    }
}

// ============ Expression Evaluation ============

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Caret,
    LParen,
    RParen,
}

fn tokenize(expr: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = expr.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '%' => {
                tokens.push(Token::Percent);
                i += 1;
            }
            '^' => {
                tokens.push(Token::Caret);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '0'..='9' | '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                // scientific notation: 1.5e-3
                if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                    let mut j = i + 1;
                    if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                        j += 1;
                    }
                    if j < chars.len() && chars[j].is_ascii_digit() {
                        i = j;
                        while i < chars.len() && chars[i].is_ascii_digit() {
                            i += 1;
                        }
                    }
                }
                let text: String = chars[start..i].iter().collect();
                let number: f64 = text
                    .parse()
                    .map_err(|_| anyhow::anyhow!("invalid number '{}'", text))?;
                tokens.push(Token::Number(number));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let ident: String = chars[start..i].iter().collect();
                tokens.push(Token::Ident(ident.to_lowercase()));
            }
            other => bail!("unexpected character '{}' in expression", other),
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    variables: &'a HashMap<String, f64>,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<&Token> {
        let token = self.tokens.get(self.pos);
        self.pos += 1;
        token
    }

    fn expect(&mut self, token: Token) -> Result<()> {
        match self.advance() {
            Some(t) if *t == token => Ok(()),
            Some(t) => bail!("expected {:?}, found {:?}", token, t),
            None => bail!("expected {:?}, found end of expression", token),
        }
    }

    // expr := term (('+' | '-') term)*
    fn expr(&mut self) -> Result<f64> {
        let mut value = self.term()?;
        loop {
            match self.peek() {
                Some(Token::Plus) => {
                    self.pos += 1;
                    value += self.term()?;
                }
                Some(Token::Minus) => {
                    self.pos += 1;
                    value -= self.term()?;
                }
                _ => return Ok(value),
            }
        }
    }

    // term := unary (('*' | '/' | '%') unary)*
    fn term(&mut self) -> Result<f64> {
        let mut value = self.unary()?;
        loop {
            match self.peek() {
                Some(Token::Star) => {
                    self.pos += 1;
                    value *= self.unary()?;
                }
                Some(Token::Slash) => {
                    self.pos += 1;
                    let divisor = self.unary()?;
                    if divisor == 0.0 {
                        bail!("division by zero");
                    }
                    value /= divisor;
                }
                Some(Token::Percent) => {
                    self.pos += 1;
                    let divisor = self.unary()?;
                    if divisor == 0.0 {
                        bail!("modulo by zero");
                    }
                    value %= divisor;
                }
                _ => return Ok(value),
            }
        }
    }

    // unary := '-' unary | power
    fn unary(&mut self) -> Result<f64> {
        if matches!(self.peek(), Some(Token::Minus)) {
            self.pos += 1;
            return Ok(-self.unary()?);
        }
        self.power()
    }

    // power := atom ('^' unary)?   (right-associative)
    fn power(&mut self) -> Result<f64> {
        let base = self.atom()?;
        if matches!(self.peek(), Some(Token::Caret)) {
            self.pos += 1;
            let exponent = self.unary()?;
            return Ok(base.powf(exponent));
        }
        Ok(base)
    }

    // atom := number | ident '(' expr ')' | ident | '(' expr ')'
    fn atom(&mut self) -> Result<f64> {
        match self.advance().cloned() {
            Some(Token::Number(n)) => Ok(n),
            Some(Token::LParen) => {
                let value = self.expr()?;
                self.expect(Token::RParen)?;
                Ok(value)
            }
            Some(Token::Ident(name)) => {
                if matches!(self.peek(), Some(Token::LParen)) {
                    self.pos += 1;
                    let arg = self.expr()?;
                    self.expect(Token::RParen)?;
                    return apply_function(&name, arg);
                }
                if let Some(value) = constant(&name) {
                    return Ok(value);
                }
                if let Some(value) = self.variables.get(&name) {
                    return Ok(*value);
                }
                bail!("unknown name '{}'", name)
            }
            Some(t) => bail!("unexpected token {:?}", t),
            None => bail!("unexpected end of expression"),
        }
    }
}

fn constant(name: &str) -> Option<f64> {
    match name {
        "pi" => Some(std::f64::consts::PI),
        "e" => Some(std::f64::consts::E),
        "tau" => Some(std::f64::consts::TAU),
        _ => None,
    }
}

fn apply_function(name: &str, arg: f64) -> Result<f64> {
    let value = match name {
        "sqrt" => arg.sqrt(),
        "cbrt" => arg.cbrt(),
        "abs" => arg.abs(),
        "ln" => arg.ln(),
        "log" | "log10" => arg.log10(),
        "log2" => arg.log2(),
        "exp" => arg.exp(),
        "sin" => arg.sin(),
        "cos" => arg.cos(),
        "tan" => arg.tan(),
        "asin" => arg.asin(),
        "acos" => arg.acos(),
        "atan" => arg.atan(),
        "sinh" => arg.sinh(),
        "cosh" => arg.cosh(),
        "tanh" => arg.tanh(),
        "floor" => arg.floor(),
        "ceil" => arg.ceil(),
        "round" => arg.round(),
        other => bail!("unknown function '{}'", other),
    };
    Ok(value)
}

/// Evaluate an expression with the given variable substitutions.
pub fn evaluate(expression: &str, variables: &HashMap<String, f64>) -> Result<f64> {
    let tokens = tokenize(expression)?;
    if tokens.is_empty() {
        bail!("empty expression");
    }
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        variables,
    };
    let value = parser.expr()?;
    if parser.pos != tokens.len() {
        bail!("unexpected trailing input in expression");
    }
    if !value.is_finite() {
        bail!("expression produced a non-finite result");
    }
    Ok(value)
}

// ============ Unit Conversion ============

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Category {
    Length,
    Mass,
    Volume,
    Time,
    Data,
}

/// Scalar factor to the category's base unit (meter, kilogram, liter,
/// second, byte).
fn unit_factor(unit: &str) -> Option<(Category, f64)> {
    use Category::*;
    let entry = match unit {
        "m" | "meter" | "meters" => (Length, 1.0),
        "km" | "kilometer" | "kilometers" => (Length, 1000.0),
        "cm" | "centimeter" | "centimeters" => (Length, 0.01),
        "mm" | "millimeter" | "millimeters" => (Length, 0.001),
        "mi" | "mile" | "miles" => (Length, 1609.344),
        "yd" | "yard" | "yards" => (Length, 0.9144),
        "ft" | "foot" | "feet" => (Length, 0.3048),
        "in" | "inch" | "inches" => (Length, 0.0254),
        "nmi" => (Length, 1852.0),

        "kg" | "kilogram" | "kilograms" => (Mass, 1.0),
        "g" | "gram" | "grams" => (Mass, 0.001),
        "mg" | "milligram" | "milligrams" => (Mass, 1e-6),
        "lb" | "lbs" | "pound" | "pounds" => (Mass, 0.453_592_37),
        "oz" | "ounce" | "ounces" => (Mass, 0.028_349_523_125),
        "t" | "tonne" | "tonnes" => (Mass, 1000.0),

        "l" | "liter" | "liters" | "litre" | "litres" => (Volume, 1.0),
        "ml" | "milliliter" | "milliliters" => (Volume, 0.001),
        "gal" | "gallon" | "gallons" => (Volume, 3.785_411_784),
        "qt" | "quart" | "quarts" => (Volume, 0.946_352_946),
        "pt" | "pint" | "pints" => (Volume, 0.473_176_473),
        "cup" | "cups" => (Volume, 0.236_588_236_5),
        "floz" => (Volume, 0.029_573_529_562_5),

        "s" | "sec" | "second" | "seconds" => (Time, 1.0),
        "ms" | "millisecond" | "milliseconds" => (Time, 0.001),
        "min" | "minute" | "minutes" => (Time, 60.0),
        "h" | "hr" | "hour" | "hours" => (Time, 3600.0),
        "day" | "days" => (Time, 86_400.0),
        "week" | "weeks" => (Time, 604_800.0),

        "byte" | "bytes" => (Data, 1.0),
        "kb" => (Data, 1e3),
        "mb" => (Data, 1e6),
        "gb" => (Data, 1e9),
        "tb" => (Data, 1e12),
        "kib" => (Data, 1024.0),
        "mib" => (Data, 1_048_576.0),
        "gib" => (Data, 1_073_741_824.0),
        "tib" => (Data, 1_099_511_627_776.0),

        _ => return None,
    };
    Some(entry)
}

fn to_celsius(value: f64, unit: &str) -> Option<f64> {
    match unit {
        "c" | "celsius" => Some(value),
        "f" | "fahrenheit" => Some((value - 32.0) * 5.0 / 9.0),
        "k" | "kelvin" => Some(value - 273.15),
        _ => None,
    }
}

fn from_celsius(value: f64, unit: &str) -> Option<f64> {
    match unit {
        "c" | "celsius" => Some(value),
        "f" | "fahrenheit" => Some(value * 9.0 / 5.0 + 32.0),
        "k" | "kelvin" => Some(value + 273.15),
        _ => None,
    }
}

/// Convert a value between two units.
///
/// Temperature units are formula-based; everything else goes through the
/// scalar-factor table. Mixing categories is an error.
pub fn convert_unit(value: f64, from: &str, to: &str) -> Result<f64> {
    let from = from.trim().to_lowercase();
    let to = to.trim().to_lowercase();

    if let Some(celsius) = to_celsius(value, &from) {
        return from_celsius(celsius, &to)
            .ok_or_else(|| anyhow::anyhow!("cannot convert temperature to '{}'", to));
    }

    let Some((from_category, from_factor)) = unit_factor(&from) else {
        bail!("unknown unit '{}'", from);
    };
    let Some((to_category, to_factor)) = unit_factor(&to) else {
        bail!("unknown unit '{}'", to);
    };
    if from_category != to_category {
        bail!("cannot convert '{}' to '{}': different unit categories", from, to);
    }

    Ok(value * from_factor / to_factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(expr: &str) -> Result<f64> {
        evaluate(expr, &HashMap::new())
    }

    #[test]
    fn precedence_and_parens() {
        assert_eq!(eval("2 + 3 * 4").unwrap(), 14.0);
        assert_eq!(eval("(2+3)*4").unwrap(), 20.0);
        assert_eq!(eval("2 ^ 3 ^ 2").unwrap(), 512.0); // right-assoc
        assert_eq!(eval("10 % 3").unwrap(), 1.0);
        assert_eq!(eval("-3 + 5").unwrap(), 2.0);
        assert_eq!(eval("--4").unwrap(), 4.0);
    }

    #[test]
    fn division_by_zero_is_an_error() {
        let err = eval("1/0").unwrap_err();
        assert!(err.to_string().contains("division by zero"));
        assert!(eval("5 % 0").is_err());
    }

    #[test]
    fn functions_and_constants() {
        assert!((eval("sqrt(16)").unwrap() - 4.0).abs() < 1e-9);
        assert!((eval("sin(0)").unwrap()).abs() < 1e-9);
        assert!((eval("cos(0)").unwrap() - 1.0).abs() < 1e-9);
        assert!((eval("ln(e)").unwrap() - 1.0).abs() < 1e-9);
        assert!((eval("log10(1000)").unwrap() - 3.0).abs() < 1e-9);
        assert_eq!(eval("floor(2.7)").unwrap(), 2.0);
        assert_eq!(eval("ceil(2.1)").unwrap(), 3.0);
        assert!((eval("2 * pi").unwrap() - std::f64::consts::TAU).abs() < 1e-9);
        assert!(eval("bogus(1)").is_err());
    }

    #[test]
    fn variables_substitute() {
        let mut vars = HashMap::new();
        vars.insert("x".to_string(), 3.0);
        vars.insert("y".to_string(), 4.0);
        assert_eq!(evaluate("sqrt(x^2 + y^2)", &vars).unwrap(), 5.0);
        assert!(evaluate("z + 1", &vars).is_err());
    }

    #[test]
    fn rejects_trailing_garbage() {
        assert!(eval("2 + 3 )").is_err());
        assert!(eval("").is_err());
        assert!(eval("2 $ 3").is_err());
    }

    #[test]
    fn kilometers_to_miles() {
        let miles = convert_unit(100.0, "km", "mi").unwrap();
        assert!((miles - 62.1371).abs() < 1e-3);
    }

    #[test]
    fn celsius_to_fahrenheit() {
        assert_eq!(convert_unit(25.0, "celsius", "fahrenheit").unwrap(), 77.0);
        assert!((convert_unit(0.0, "c", "k").unwrap() - 273.15).abs() < 1e-9);
    }

    #[test]
    fn mixed_categories_rejected() {
        assert!(convert_unit(1.0, "km", "kg").is_err());
        assert!(convert_unit(1.0, "kg", "fahrenheit").is_err());
        assert!(convert_unit(1.0, "furlong", "m").is_err());
    }

    #[tokio::test]
    async fn execute_builds_trace() {
        let tool = CalculatorTool::new();
        let output = tool
            .execute(&serde_json::json!({
                "expression": "100",
                "convert": {"from": "km", "to": "mi"},
                "round": 4
            }))
            .await
            .unwrap();
        assert!((output["result"].as_f64().unwrap() - 62.1371).abs() < 1e-9);
        assert_eq!(output["unit"], "mi");
        let trace = output["trace"].as_array().unwrap();
        assert_eq!(trace.len(), 3); // evaluated, converted, rounded
    }

    #[tokio::test]
    async fn execute_never_panics_on_bad_input() {
        let tool = CalculatorTool::new();
        assert!(tool.execute(&serde_json::json!({})).await.is_err());
        assert!(tool
            .execute(&serde_json::json!({"expression": "1/0"}))
            .await
            .is_err());
        assert!(tool
            .execute(&serde_json::json!({"expression": "2", "variables": {"x": "nan"}}))
            .await
            .is_err());
    }
}
