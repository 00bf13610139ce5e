//! Reversal of known obfuscation families.
//!
//! Each family is recognised by a structural marker and reversed by a pure
//! handler. Handlers return `Err` when the construct they expect is not
//! there; the caller then keeps its input, so a false marker hit costs
//! nothing.

use super::calc::{calc, format_number};
use super::codecs::{
    base64_decode, base64_roundtrip, bytes_to_text, gzinflate, str_rot13, strtr, urldecode,
    DecodeFn,
};
use crate::types::DecodeError;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use tracing::trace;

/// Recursion bound for the literal/variable resolver behind the eval family.
pub const MAX_DECODE_STRING_DEPTH: usize = 100;

/// Upper bound on FOPO layers peeled off one payload.
const MAX_FOPO_LAYERS: usize = 32;

/// Longest string table body the globals family will index.
const MAX_TABLE_SPAN: usize = 30_000;

/// Known obfuscation families, in dispatch priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FamilyTag {
    /// String tables stashed in `$GLOBALS[...]` or returned by index functions.
    Globals,
    /// `eval(DECODE(...))` statements.
    Eval,
    /// `__FILE__` self-reading loader with a translated base64 tail.
    Als,
    /// Pointer-pair self-referential base64 slice (LockIt).
    Lockit,
    /// Colon-delimited base64 → rot13 → gzinflate layers (FOPO).
    Fopo,
    /// `$_F=__FILE__;$_X='...'` transposed base64 (ByteRun).
    Byterun,
    /// urlencoded alphabet assembled into `${"GLOBALS"}` names.
    UrldecodeGlobals,
}

/// A family handler: rebuilds plain PHP from obfuscated text.
pub type FamilyHandler = fn(&str, &SourceContext) -> Result<String, DecodeError>;

/// Read-only context shared by the handlers of one deobfuscation call.
#[derive(Debug, Clone, Copy)]
pub struct SourceContext<'a> {
    /// Whole file text, used to resolve variable assignments.
    pub full_code: &'a str,
}

impl FamilyTag {
    /// Dispatch order: globals rewrite first, then eval chains, then the
    /// named one-off families.
    pub const PRIORITY: [FamilyTag; 7] = [
        FamilyTag::Globals,
        FamilyTag::Eval,
        FamilyTag::Als,
        FamilyTag::Lockit,
        FamilyTag::Fopo,
        FamilyTag::Byterun,
        FamilyTag::UrldecodeGlobals,
    ];

    pub fn name(self) -> &'static str {
        match self {
            FamilyTag::Globals => "globals",
            FamilyTag::Eval => "eval",
            FamilyTag::Als => "als",
            FamilyTag::Lockit => "lockit",
            FamilyTag::Fopo => "fopo",
            FamilyTag::Byterun => "byterun",
            FamilyTag::UrldecodeGlobals => "urldecode_globals",
        }
    }

    /// Whether the family's marker fires on `text`.
    pub fn detect(self, text: &str) -> bool {
        match self {
            FamilyTag::Globals => {
                GLOBALS_ARRAY_MARKER.is_match(text) || GLOBALS_FUNC_MARKER.is_match(text)
            }
            FamilyTag::Eval => EVAL_MARKER.is_match(text),
            FamilyTag::Als => ALS_LAYER1.is_match(text),
            FamilyTag::Lockit => LOCKIT_MARKER.is_match(text),
            FamilyTag::Fopo => FOPO_MARKER.is_match(text),
            FamilyTag::Byterun => BYTERUN_MARKER.is_match(text),
            FamilyTag::UrldecodeGlobals => find_url_globals(text).is_some(),
        }
    }

    pub fn handler(self) -> FamilyHandler {
        match self {
            FamilyTag::Globals => deobfuscate_globals,
            FamilyTag::Eval => deobfuscate_eval,
            FamilyTag::Als => deobfuscate_als,
            FamilyTag::Lockit => deobfuscate_lockit,
            FamilyTag::Fopo => deobfuscate_fopo,
            FamilyTag::Byterun => deobfuscate_byterun,
            FamilyTag::UrldecodeGlobals => deobfuscate_urldecode_globals,
        }
    }
}

/// Every family whose marker fires, in priority order.
pub fn classify(text: &str) -> Vec<FamilyTag> {
    let text = strip_empty_concat(text);
    FamilyTag::PRIORITY
        .into_iter()
        .filter(|tag| tag.detect(&text))
        .collect()
}

/// Drop `.''` / `''.` style no-op concatenations.
pub fn strip_empty_concat(text: &str) -> String {
    text.replace(".''", "")
        .replace("''.", "")
        .replace(".\"\"", "")
        .replace("\"\".", "")
}

// --- markers --------------------------------------------------------------

static GLOBALS_ARRAY_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\$(?:\{["'])?GLOBALS(?:["']\})?\[\s*['"]_+\w{1,60}['"]\s*\]\s*=\s*(?:array\s*\(|\[)\s*base64_decode\s*\("#)
        .expect("valid globals marker")
});

static GLOBALS_FUNC_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)function\s*_+\d+\s*\(\s*\$i\s*\)\s*\{\s*\$a\s*=\s*(?:Array|\[)")
        .expect("valid globals marker")
});

static EVAL_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)eval\((?:base64_decode|gzinflate|strrev|str_rot13|gzuncompress)")
        .expect("valid eval marker")
});

static ALS_LAYER1: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)__FILE__;\$[O0]+=[0-9a-fx]+;eval\(\$[O0]+\('([^']+)'\)\);return;")
        .expect("valid als regex")
});

static ALS_LAYER2: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\$[O0]+=(?:\$[O0]+\()+\$[O0]+,[0-9a-fx]+\),'([^']+)','([^']+)'\)\);eval\(")
        .expect("valid als regex")
});

static LOCKIT_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\$[O0]*=urldecode\('%66%67%36%73%62%65%68%70%72%61%34%63%6f%5f%74%6e%64'\);\s*\$(?:["']\})?GLOBALS(?:["']\})?\['[O0]*'\]=\$[O0]*"#)
        .expect("valid lockit marker")
});

static FOPO_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\$\w+="(?:\\x?[0-9a-f]+){13}";@eval\(\$\w+\("#).expect("valid fopo marker")
});

static BYTERUN_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$_F=__FILE__;\$_X='[^']+';eval\(").expect("valid byterun marker")
});

static BYTERUN_CALL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?mi)\$_F=__FILE__;\$_X='([^']+)';\s*eval\s*\(\s*\$?\w{1,60}\s*\(\s*['"][^'"]+['"]\s*\)\s*\)\s*;"#)
        .expect("valid byterun regex")
});

static URL_ALPHABET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)(\$[O0_]+)=urldecode\("([%0-9a-f]+)"\);"#).expect("valid urldecode regex")
});

// --- shared helpers -------------------------------------------------------

static EVAL_CODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"eval\((.*?)\);").expect("valid eval regex"));

static DOUBLE_QUOTED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""(.*?)""#).expect("valid quote regex"));

static SINGLE_QUOTED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"'(.*?)'").expect("valid quote regex"));

static HEX_VALUE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"0x[a-fA-F0-9]{1,8}").expect("valid hex regex"));

/// Argument of the first `eval(...);` on a line.
fn eval_code(text: &str) -> Option<&str> {
    EVAL_CODE.captures(text).and_then(|c| c.get(1)).map(|m| m.as_str())
}

/// Content of the last double-quoted string, or else the last single-quoted one.
fn text_inside_quotes(text: &str) -> Option<&str> {
    DOUBLE_QUOTED
        .captures_iter(text)
        .last()
        .or_else(|| SINGLE_QUOTED.captures_iter(text).last())
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

fn hex_values(text: &str) -> Vec<u64> {
    HEX_VALUE
        .find_iter(text)
        .filter_map(|m| u64::from_str_radix(&m.as_str()[2..], 16).ok())
        .collect()
}

fn decode_b64_text(text: &str) -> Result<String, DecodeError> {
    base64_decode(text.as_bytes()).map(bytes_to_text)
}

// --- globals --------------------------------------------------------------

static QUOTE_CONCAT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?mi)["']\s*\.\s*['"]"#).expect("valid concat regex"));

static MIN_MAX_EXPR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)(?:min|max)\(\s*\d+[,|\s+\-*/][\d\s.,+\-*/]+\)").expect("valid min/max regex")
});

static ROUND_CALL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?smi)round\((.+?)\)").expect("valid round regex"));

static BASE64_CALL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?smi)base64_decode\(["'](.*?)["']\)"#).expect("valid base64 call regex")
});

static QUOTED_LITERAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?sm)["'](.*?)["']"#).expect("valid literal regex"));

static GLOBALS_ARRAY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?smi)\$(?:\{["'])?GLOBALS(?:["']\})?\[["'](.+?)["']\]\s*=\s*Array\((.+?)\);"#)
        .expect("valid globals array regex")
});

static FUNC_TABLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?smi)function\s*(\w{1,60})\(\$\w+\)\{\$\w{1,60}\s*=\s*Array\((.+?)\);[^}]+\}")
        .expect("valid function table regex")
});

static EMPTY_PHP_TAGS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?mi)<\?(?:php)?\s*\?>").expect("valid tag regex"));

static STATIC_TABLE_HEAD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?smi)<\?\s*function\s*(_+.{1,60}?)\(\$[_0-9]+\)\{\s*static\s*\$([_0-9]+)\s*=\s*(?:true|false);")
        .expect("valid static table regex")
});

/// Rewrite string tables that are only ever read by constant index.
fn deobfuscate_globals(text: &str, _ctx: &SourceContext) -> Result<String, DecodeError> {
    let res = QUOTE_CONCAT.replace_all(text, "");
    let res = MIN_MAX_EXPR.replace_all(&res, |caps: &Captures| calc(&caps[0]));
    let res = ROUND_CALL.replace_all(&res, |caps: &Captures| match caps[1].trim().parse::<f64>() {
        Ok(v) => format_number(v.round()),
        Err(_) => caps[0].to_string(),
    });
    let res = BASE64_CALL.replace_all(&res, |caps: &Captures| {
        match base64_decode(caps[1].as_bytes()) {
            Ok(bytes) => format!("'{}'", bytes_to_text(bytes)),
            Err(_) => caps[0].to_string(),
        }
    });
    let res = QUOTED_LITERAL.replace_all(&res, |caps: &Captures| {
        let inner = &caps[1];
        match base64_roundtrip(inner) {
            Some(bytes) if bytes.iter().all(|b| (b' '..=b'~').contains(b)) => {
                format!("'{}'", bytes_to_text(bytes))
            }
            _ => format!("'{}'", inner),
        }
    });
    let mut res = res.into_owned();

    let tables: Vec<(String, Vec<String>)> = GLOBALS_ARRAY
        .captures_iter(&res)
        .map(|caps| (caps[1].to_string(), split_table(&caps[2], ",", true)))
        .collect();
    for (var, entries) in tables {
        let pattern = format!(
            r#"(?smi)\$(?:\{{["'])?GLOBALS(?:["']\}})?\['{}'\]\[(\d+)\]"#,
            regex::escape(&var)
        );
        res = substitute_index_calls(&res, &pattern, &entries, "")?;
    }

    let functions: Vec<(String, Vec<String>)> = FUNC_TABLE
        .captures_iter(&res)
        .filter(|caps| caps[2].len() <= MAX_TABLE_SPAN)
        .map(|caps| (caps[1].to_string(), split_table(&caps[2], ",", false)))
        .collect();
    for (name, entries) in functions {
        let pattern = format!(r"(?smi){}\((\d+)\)", regex::escape(&name));
        res = substitute_index_calls(&res, &pattern, &entries, "")?;
    }

    let mut res = EMPTY_PHP_TAGS.replace_all(&res, "").into_owned();

    for (name, entries) in static_tables(&res) {
        let pattern = format!(r"(?sm){}\((\d+)\)", regex::escape(&name));
        res = substitute_index_calls(&res, &pattern, &entries, "'")?;
    }

    Ok(res)
}

fn split_table(body: &str, separator: &str, trim_quotes: bool) -> Vec<String> {
    body.split(separator)
        .map(|v| {
            if trim_quotes {
                v.trim_matches('\'').to_string()
            } else {
                v.to_string()
            }
        })
        .collect()
}

/// Replace `NAME(N)`-style references by entry `N` of `entries`.
/// Out-of-range indices are left as they are.
fn substitute_index_calls(
    text: &str,
    pattern: &str,
    entries: &[String],
    suffix: &str,
) -> Result<String, DecodeError> {
    let re = Regex::new(pattern).map_err(|_| DecodeError::PatternMiss("index reference"))?;
    Ok(re
        .replace_all(text, |caps: &Captures| {
            caps[1]
                .parse::<usize>()
                .ok()
                .and_then(|i| entries.get(i))
                .map(|entry| format!("{}{}", entry, suffix))
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned())
}

/// `<? function _X($i){ static $v = false; ... $v = array(...); return base64_decode($v...`
fn static_tables(text: &str) -> Vec<(String, Vec<String>)> {
    let mut tables = Vec::new();

    for head in STATIC_TABLE_HEAD.captures_iter(text) {
        let (Some(whole), Some(name)) = (head.get(0), head.get(1)) else {
            continue;
        };
        let var = regex::escape(&head[2]);
        let body = Regex::new(&format!(
            r"(?si)^.+?\${var}=array\((.*?)\);\s*return\s*base64_decode\(\${var}"
        ));
        let Ok(body) = body else { continue };

        let rest = &text[whole.end()..];
        if let Some(caps) = body.captures(rest) {
            if caps[0].len() <= MAX_TABLE_SPAN {
                tables.push((name.as_str().to_string(), split_table(&caps[1], "',", false)));
            }
        }
    }

    tables
}

// --- eval -----------------------------------------------------------------

static EVAL_CALL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?msi)eval\((?:base64_decode|gzinflate|strrev|str_rot13|gzuncompress).*?\);")
        .expect("valid eval call regex")
});

static VAR_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\$\w+").expect("valid variable regex"));

/// Replace each `eval(DECODE(...));` statement with the code it evaluates.
fn deobfuscate_eval(text: &str, ctx: &SourceContext) -> Result<String, DecodeError> {
    if !EVAL_CALL.is_match(text) {
        return Err(DecodeError::PatternMiss("eval call"));
    }

    Ok(EVAL_CALL
        .replace_all(text, |caps: &Captures| {
            let statement = &caps[0];
            let argument = &statement["eval(".len()..statement.len() - 2];
            match decode_string(argument, ctx, 0) {
                Ok(bytes) => bytes_to_text(bytes),
                Err(e) => {
                    trace!("eval statement left as is: {}", e);
                    statement.to_string()
                }
            }
        })
        .into_owned())
}

/// Resolve a decode-call argument one layer per recursion level.
///
/// Quoted literals resolve to their content; `$var` resolves to the last
/// literal assigned to it anywhere in the source; `f(x)` applies `f` to the
/// resolved `x` when `f` is a known decoder and passes `x` through otherwise.
pub fn decode_string(
    expr: &str,
    ctx: &SourceContext,
    depth: usize,
) -> Result<Vec<u8>, DecodeError> {
    let expr = expr.trim();
    if expr.is_empty() {
        return Err(DecodeError::Empty);
    }
    if depth > MAX_DECODE_STRING_DEPTH {
        return Err(DecodeError::RecursionLimit);
    }

    let first = expr.as_bytes()[0];
    if first == b'\'' || first == b'"' {
        let quote = first as char;
        let rest = &expr[1..];
        let content = match rest.find(quote) {
            Some(end) => &rest[..end],
            None => rest.trim_end_matches(|c| c == ')' || c == quote),
        };
        return Ok(content.as_bytes().to_vec());
    }

    if first == b'$' {
        let var = VAR_NAME
            .find(expr)
            .ok_or(DecodeError::PatternMiss("variable name"))?;
        let assignment = Regex::new(&format!(
            r#"(?msi){}\b\s*=\s*['"]([^"']+)['"]"#,
            regex::escape(var.as_str())
        ))
        .map_err(|_| DecodeError::PatternMiss("variable assignment"))?;
        return assignment
            .captures_iter(ctx.full_code)
            .last()
            .map(|caps| caps[1].as_bytes().to_vec())
            .ok_or(DecodeError::PatternMiss("variable assignment"));
    }

    let open = expr
        .find('(')
        .ok_or(DecodeError::PatternMiss("function call"))?;
    let function = &expr[..open];
    let argument = decode_string(&expr[open + 1..], ctx, depth + 1)?;

    match DecodeFn::from_name(function) {
        Some(func) => func.apply(&argument),
        None => Ok(argument),
    }
}

// --- als ------------------------------------------------------------------

/// Offset of the translated base64 payload inside the trailing data block.
const ALS_PAYLOAD_OFFSET: usize = 380;

fn deobfuscate_als(text: &str, _ctx: &SourceContext) -> Result<String, DecodeError> {
    let layer1 = ALS_LAYER1
        .captures(text)
        .ok_or(DecodeError::PatternMiss("als loader"))?;
    let loader = decode_b64_text(&layer1[1])?;
    let layer2 = ALS_LAYER2
        .captures(&loader)
        .ok_or(DecodeError::PatternMiss("als translation table"))?;

    let tail = text.rsplit("?>").next().unwrap_or("");
    let payload = tail
        .as_bytes()
        .get(ALS_PAYLOAD_OFFSET..)
        .filter(|p| !p.is_empty())
        .ok_or(DecodeError::PatternMiss("als payload"))?;

    let translated = strtr(payload, layer2[1].as_bytes(), layer2[2].as_bytes());
    let code = bytes_to_text(base64_decode(&translated)?);
    Ok(format!("<?php {} ?>", code))
}

// --- lockit ---------------------------------------------------------------

fn deobfuscate_lockit(text: &str, _ctx: &SourceContext) -> Result<String, DecodeError> {
    let quoted = eval_code(text)
        .and_then(text_inside_quotes)
        .ok_or(DecodeError::PatternMiss("lockit eval"))?;
    let loader = decode_b64_text(quoted)?;

    let loader_hex = hex_values(&loader);
    let length = *hex_values(text)
        .first()
        .ok_or(DecodeError::PatternMiss("lockit length pointer"))?;
    let (&offset_a, &offset_b) = loader_hex
        .first()
        .zip(loader_hex.get(1))
        .ok_or(DecodeError::PatternMiss("lockit offset pointers"))?;

    let needles: Vec<&str> = SINGLE_QUOTED
        .captures_iter(&loader)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect();
    if needles.len() < 2 {
        return Err(DecodeError::PatternMiss("lockit translation table"));
    }
    let from = needles[needles.len() - 2];
    let to = needles[needles.len() - 1];

    let bytes = text.as_bytes();
    let start = usize::try_from(offset_a.saturating_add(offset_b)).unwrap_or(usize::MAX);
    let end = start
        .saturating_add(usize::try_from(length).unwrap_or(usize::MAX))
        .min(bytes.len());
    let slice = bytes
        .get(start..end)
        .ok_or(DecodeError::PatternMiss("lockit payload"))?;

    let code = bytes_to_text(base64_decode(&strtr(slice, from.as_bytes(), to.as_bytes()))?);
    Ok(format!("<?php {} ?>", code))
}

// --- fopo -----------------------------------------------------------------

fn format_php(text: &str) -> String {
    text.replace("<?php", "")
        .replace("?>", "")
        .replace('\n', "")
        .replace(';', ";\n")
}

/// One FOPO layer: quoted eval argument, optionally rot13'd, base64, deflate.
fn fopo_layer(quoted: &str, rot13: bool) -> Result<String, DecodeError> {
    let bytes = if rot13 {
        str_rot13(quoted.as_bytes())
    } else {
        quoted.as_bytes().to_vec()
    };
    Ok(bytes_to_text(gzinflate(&base64_decode(&bytes)?)?))
}

fn deobfuscate_fopo(text: &str, _ctx: &SourceContext) -> Result<String, DecodeError> {
    let formatted = format_php(text);
    let quoted = eval_code(&formatted)
        .and_then(text_inside_quotes)
        .ok_or(DecodeError::PatternMiss("fopo eval"))?;
    let loader = decode_b64_text(quoted)?;

    let last = loader.rsplit(':').next().unwrap_or("");
    let quoted = text_inside_quotes(last).ok_or(DecodeError::PatternMiss("fopo payload"))?;
    let mut code = fopo_layer(quoted, true)?;

    let mut old = String::new();
    for _ in 0..MAX_FOPO_LAYERS {
        if old == code || !code.contains("@eval($") {
            break;
        }
        old = code.clone();

        let rot13 = match code.split(';').count() {
            5 => true,
            4 => false,
            _ => break,
        };
        let Some(quoted) = eval_code(&code).and_then(text_inside_quotes) else {
            break;
        };
        match fopo_layer(quoted, rot13) {
            Ok(next) => code = next,
            Err(e) => {
                trace!("fopo layer stopped: {}", e);
                break;
            }
        }
    }

    Ok(code.get(2..).unwrap_or("").to_string())
}

// --- byterun --------------------------------------------------------------

fn deobfuscate_byterun(text: &str, _ctx: &SourceContext) -> Result<String, DecodeError> {
    let caps = BYTERUN_CALL
        .captures(text)
        .ok_or(DecodeError::PatternMiss("byterun loader"))?;
    let decoded = base64_decode(caps[1].as_bytes())?;
    let code = bytes_to_text(strtr(&decoded, b"123456aouie", b"aouie123456"));
    Ok(format!("<?php {} ?>", text.replace(&caps[0], &code)))
}

// --- urldecode globals ----------------------------------------------------

/// `$O=urldecode("%..");$O0=$O{4}.$O{1};...` with every index read from the
/// same alphabet variable.
#[derive(Debug)]
struct UrlGlobals<'t> {
    var: &'t str,
    encoded: &'t str,
    assignments: &'t str,
}

fn find_url_globals(text: &str) -> Option<UrlGlobals<'_>> {
    for head in URL_ALPHABET.captures_iter(text) {
        let (Some(whole), Some(var), Some(encoded)) = (head.get(0), head.get(1), head.get(2))
        else {
            continue;
        };
        let pattern = format!(
            r"(?i)^(?:\$[O0_]+=(?:{}\{{\d+\}}\.?)+;)+",
            regex::escape(var.as_str())
        );
        let Ok(assignments) = Regex::new(&pattern) else {
            continue;
        };
        let rest = &text[whole.end()..];
        if let Some(m) = assignments.find(rest) {
            return Some(UrlGlobals {
                var: var.as_str(),
                encoded: encoded.as_str(),
                assignments: m.as_str(),
            });
        }
    }
    None
}

fn deobfuscate_urldecode_globals(text: &str, _ctx: &SourceContext) -> Result<String, DecodeError> {
    let found = find_url_globals(text).ok_or(DecodeError::PatternMiss("urldecode alphabet"))?;
    let alphabet = urldecode(found.encoded.as_bytes());

    let mut names = found.assignments.to_string();
    for (i, &b) in alphabet.iter().enumerate() {
        let ch = (b as char).to_string();
        names = names
            .replace(&format!("{}{{{}}}.", found.var, i), &ch)
            .replace(&format!("{}{{{}}}", found.var, i), &ch);
    }

    let mut res = text.replace(found.assignments, &names);
    for statement in names.split(';') {
        let parts: Vec<&str> = statement.split('=').collect();
        if let [name, value] = parts.as_slice() {
            let name = name.replace('$', "");
            res = res.replace(&format!("${{\"GLOBALS\"}}[\"{}\"]", name), value);
        }
    }

    Ok(res)
}
