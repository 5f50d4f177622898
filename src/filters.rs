//! Filter and test catalog.
//!
//! Filters are pure functions `(input, args) -> value`; tests are pure
//! predicates used by `x is name`. Both are looked up by name, and hosts
//! can add their own through [`Engine`](crate::Engine).

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::value::Value;

/// Signature of a filter: input value and evaluated arguments.
pub type FilterFn = dyn Fn(Value, &[Value]) -> Result<Value, String> + Send + Sync;

/// Signature of an `is` test.
pub type TestFn = dyn Fn(&Value, &[Value]) -> Result<bool, String> + Send + Sync;

#[derive(Clone)]
struct Filter {
    func: Arc<FilterFn>,
    /// Whether the filter runs on an `Undefined` input. Everything else
    /// passes `Undefined` straight through.
    rescues_undefined: bool,
}

#[derive(Clone)]
pub struct FilterRegistry {
    filters: FxHashMap<String, Filter>,
    tests: FxHashMap<String, Arc<TestFn>>,
}

impl fmt::Debug for FilterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut filters: Vec<_> = self.filters.keys().collect();
        let mut tests: Vec<_> = self.tests.keys().collect();
        filters.sort();
        tests.sort();
        f.debug_struct("FilterRegistry")
            .field("filters", &filters)
            .field("tests", &tests)
            .finish()
    }
}

impl Default for FilterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FilterRegistry {
    /// A registry holding every built-in filter and test.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.install_builtins();
        registry
    }

    /// A registry with nothing in it.
    pub fn empty() -> Self {
        Self {
            filters: FxHashMap::default(),
            tests: FxHashMap::default(),
        }
    }

    /// Adds or replaces a filter.
    pub fn register_filter<F>(&mut self, name: impl Into<String>, func: F)
    where
        F: Fn(Value, &[Value]) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.filters.insert(
            name.into(),
            Filter {
                func: Arc::new(func),
                rescues_undefined: false,
            },
        );
    }

    /// Adds or replaces a test.
    pub fn register_test<F>(&mut self, name: impl Into<String>, func: F)
    where
        F: Fn(&Value, &[Value]) -> Result<bool, String> + Send + Sync + 'static,
    {
        self.tests.insert(name.into(), Arc::new(func));
    }

    pub fn has_filter(&self, name: &str) -> bool {
        self.filters.contains_key(name)
    }

    pub fn has_test(&self, name: &str) -> bool {
        self.tests.contains_key(name)
    }

    /// Runs filter `name`. `None` means no such filter.
    pub fn apply_filter(&self, name: &str, value: Value, args: &[Value]) -> Option<Result<Value, String>> {
        let filter = self.filters.get(name)?;
        if value.is_undefined() && !filter.rescues_undefined {
            return Some(Ok(Value::Undefined));
        }
        Some((filter.func)(value, args))
    }

    /// Runs test `name`. `None` means no such test.
    pub fn apply_test(&self, name: &str, value: &Value, args: &[Value]) -> Option<Result<bool, String>> {
        let test = self.tests.get(name)?;
        Some(test(value, args))
    }

    fn builtin(&mut self, name: &str, func: fn(Value, &[Value]) -> Result<Value, String>) {
        self.filters.insert(
            name.to_string(),
            Filter {
                func: Arc::new(func),
                rescues_undefined: false,
            },
        );
    }

    fn install_builtins(&mut self) {
        self.builtin("upper", |v, _| Ok(map_str(v, str::to_uppercase)));
        self.builtin("lower", |v, _| Ok(map_str(v, str::to_lowercase)));
        self.builtin("capitalize", |v, _| Ok(map_str(v, capitalize)));
        self.builtin("title", |v, _| Ok(map_str(v, title)));
        self.builtin("trim", |v, _| Ok(map_str(v, |s| s.trim().to_string())));
        self.builtin("length", length);
        self.builtin("count", length);
        self.builtin("join", join);
        self.builtin("sort", sort);
        self.builtin("reverse", reverse);
        self.builtin("first", |v, _| first_or_last(v, true));
        self.builtin("last", |v, _| first_or_last(v, false));
        self.builtin("sum", sum);
        self.builtin("safe", |v, _| Ok(Value::Safe(v.to_string())));
        self.builtin("escape", escape);
        self.builtin("e", escape);
        self.builtin("abs", |v, _| match v {
            Value::Int(i) => Ok(i.checked_abs().map_or(Value::Float((i as f64).abs()), Value::Int)),
            Value::Float(f) => Ok(Value::Float(f.abs())),
            other => Err(format!("expected a number, got {}", other.type_name())),
        });
        self.builtin("round", round);
        self.builtin("int", to_int);
        self.builtin("float", to_float);
        self.builtin("list", to_list);
        self.builtin("dict", to_dict);
        self.builtin("string", |v, _| match v {
            Value::Safe(s) => Ok(Value::Safe(s)),
            other => Ok(Value::String(other.to_string())),
        });
        self.builtin("replace", replace);
        self.builtin("truncate", truncate);
        self.builtin("indent", indent);
        self.builtin("wordcount", |v, _| {
            let count = v.to_string().split_whitespace().count();
            Ok(Value::Int(i64::try_from(count).unwrap_or(i64::MAX)))
        });
        self.builtin("unique", unique);
        self.builtin("min", |v, _| extreme(v, Ordering::Less));
        self.builtin("max", |v, _| extreme(v, Ordering::Greater));
        self.builtin("items", items);
        self.builtin("tojson", tojson);

        for name in ["default", "d"] {
            self.filters.insert(
                name.to_string(),
                Filter {
                    func: Arc::new(default),
                    rescues_undefined: true,
                },
            );
        }

        self.register_test("defined", |v, _| Ok(!v.is_undefined()));
        self.register_test("undefined", |v, _| Ok(v.is_undefined()));
        self.register_test("none", |v, _| Ok(matches!(v, Value::Null)));
        self.register_test("null", |v, _| Ok(matches!(v, Value::Null)));
        self.register_test("boolean", |v, _| Ok(matches!(v, Value::Bool(_))));
        self.register_test("number", |v, _| Ok(v.is_number()));
        self.register_test("integer", |v, _| Ok(matches!(v, Value::Int(_))));
        self.register_test("float", |v, _| Ok(matches!(v, Value::Float(_))));
        self.register_test("string", |v, _| Ok(v.as_str().is_some()));
        self.register_test("mapping", |v, _| Ok(matches!(v, Value::Map(_))));
        self.register_test("sequence", |v, _| {
            Ok(matches!(v, Value::List(_) | Value::String(_) | Value::Safe(_)))
        });
        self.register_test("iterable", |v, _| {
            Ok(matches!(v, Value::List(_) | Value::Map(_) | Value::String(_) | Value::Safe(_)))
        });
        self.register_test("even", |v, _| Ok(integer(v, "even")? % 2 == 0));
        self.register_test("odd", |v, _| Ok(integer(v, "odd")? % 2 != 0));
        self.register_test("divisibleby", |v, args| {
            let n = integer(v, "divisibleby")?;
            let d = integer(arg(args, 0).unwrap_or(&Value::Undefined), "divisibleby")?;
            if d == 0 {
                return Err("divisibleby(0)".to_string());
            }
            Ok(n % d == 0)
        });
        self.register_test("lower", |v, _| Ok(cased(v, char::is_lowercase, char::is_uppercase)));
        self.register_test("upper", |v, _| Ok(cased(v, char::is_uppercase, char::is_lowercase)));
        self.register_test("empty", |v, _| {
            Ok(match v {
                Value::Undefined | Value::Null => true,
                Value::String(s) | Value::Safe(s) => s.is_empty(),
                Value::List(l) => l.is_empty(),
                Value::Map(m) => m.is_empty(),
                _ => false,
            })
        });
    }
}

/// Escapes the five HTML-significant characters.
pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

fn arg(args: &[Value], i: usize) -> Option<&Value> {
    args.get(i).filter(|v| !v.is_undefined())
}

/// Applies a string transformation, keeping `Safe` input safe.
fn map_str(v: Value, f: impl Fn(&str) -> String) -> Value {
    match v {
        Value::Safe(s) => Value::Safe(f(&s)),
        Value::String(s) => Value::String(f(&s)),
        other => Value::String(f(&other.to_string())),
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.as_str().to_lowercase().chars()).collect(),
        None => String::new(),
    }
}

fn title(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut at_word_start = true;
    for c in s.chars() {
        if c.is_alphanumeric() {
            if at_word_start {
                out.extend(c.to_uppercase());
            } else {
                out.extend(c.to_lowercase());
            }
            at_word_start = false;
        } else {
            out.push(c);
            at_word_start = c.is_whitespace() || c == '-' || c == '(';
        }
    }
    out
}

fn len_value(n: usize) -> Value {
    Value::Int(i64::try_from(n).unwrap_or(i64::MAX))
}

fn length(v: Value, _: &[Value]) -> Result<Value, String> {
    match v {
        Value::String(s) | Value::Safe(s) => Ok(len_value(s.chars().count())),
        Value::List(l) => Ok(len_value(l.len())),
        Value::Map(m) => Ok(len_value(m.len())),
        Value::Null => Ok(Value::Int(0)),
        other => Err(format!("{} has no length", other.type_name())),
    }
}

fn default(v: Value, args: &[Value]) -> Result<Value, String> {
    let fallback = args.first().cloned().unwrap_or_else(|| Value::String(String::new()));
    let falsy_too = args.get(1).is_some_and(Value::is_truthy);
    if v.is_none() || (falsy_too && !v.is_truthy()) {
        Ok(fallback)
    } else {
        Ok(v)
    }
}

fn join(v: Value, args: &[Value]) -> Result<Value, String> {
    let sep = arg(args, 0).map(ToString::to_string).unwrap_or_default();
    match v {
        Value::List(items) => {
            let safe = !items.is_empty() && items.iter().all(|i| matches!(i, Value::Safe(_)));
            let joined = items.iter().map(ToString::to_string).collect::<Vec<_>>().join(&sep);
            Ok(if safe { Value::Safe(joined) } else { Value::String(joined) })
        }
        Value::String(s) | Value::Safe(s) => {
            Ok(Value::String(s.chars().map(String::from).collect::<Vec<_>>().join(&sep)))
        }
        other => Err(format!("cannot join {}", other.type_name())),
    }
}

fn sort(v: Value, args: &[Value]) -> Result<Value, String> {
    let reverse = arg(args, 0).is_some_and(Value::is_truthy);
    let mut items = match v {
        Value::List(items) => items,
        Value::Map(m) => m.into_keys().map(Value::String).collect(),
        other => return Err(format!("cannot sort {}", other.type_name())),
    };
    let mut failure = None;
    items.sort_by(|a, b| {
        a.compare(b).unwrap_or_else(|e| {
            failure.get_or_insert(e);
            Ordering::Equal
        })
    });
    if let Some(e) = failure {
        return Err(e);
    }
    if reverse {
        items.reverse();
    }
    Ok(Value::List(items))
}

fn reverse(v: Value, _: &[Value]) -> Result<Value, String> {
    match v {
        Value::List(mut items) => {
            items.reverse();
            Ok(Value::List(items))
        }
        Value::String(s) => Ok(Value::String(s.chars().rev().collect())),
        Value::Safe(s) => Ok(Value::Safe(s.chars().rev().collect())),
        other => Err(format!("cannot reverse {}", other.type_name())),
    }
}

fn first_or_last(v: Value, first: bool) -> Result<Value, String> {
    match v {
        Value::List(items) => {
            let item = if first { items.into_iter().next() } else { items.into_iter().last() };
            Ok(item.unwrap_or_default())
        }
        Value::String(s) | Value::Safe(s) => {
            let c = if first { s.chars().next() } else { s.chars().last() };
            Ok(c.map_or(Value::Undefined, |c| Value::String(c.to_string())))
        }
        other => Err(format!("{} has no items", other.type_name())),
    }
}

fn sum(v: Value, args: &[Value]) -> Result<Value, String> {
    let Value::List(items) = v else {
        return Err(format!("cannot sum {}", v.type_name()));
    };
    let start = arg(args, 0).cloned().unwrap_or(Value::Int(0));
    items.iter().try_fold(start, |acc, item| {
        if !item.is_number() {
            return Err(format!("cannot sum {}", item.type_name()));
        }
        acc.add(item)
    })
}

fn escape(v: Value, _: &[Value]) -> Result<Value, String> {
    match v {
        Value::Safe(s) => Ok(Value::Safe(s)),
        other => Ok(Value::Safe(escape_html(&other.to_string()))),
    }
}

fn round(v: Value, args: &[Value]) -> Result<Value, String> {
    let Some(x) = v.as_f64() else {
        return Err(format!("cannot round {}", v.type_name()));
    };
    let precision = arg(args, 0).and_then(Value::as_i64).unwrap_or(0).clamp(0, 15);
    let method = arg(args, 1).and_then(Value::as_str).unwrap_or("common");
    let scale = 10f64.powi(precision as i32);
    let scaled = x * scale;
    let rounded = match method {
        "common" => scaled.round(),
        "floor" => scaled.floor(),
        "ceil" => scaled.ceil(),
        other => return Err(format!("unknown rounding method `{other}`")),
    };
    Ok(Value::Float(rounded / scale))
}

fn to_int(v: Value, args: &[Value]) -> Result<Value, String> {
    let fallback = arg(args, 0).cloned().unwrap_or(Value::Int(0));
    Ok(match v {
        Value::Int(i) => Value::Int(i),
        Value::Float(f) if f.is_finite() => Value::Int(f.trunc() as i64),
        Value::Bool(b) => Value::Int(i64::from(b)),
        Value::String(s) | Value::Safe(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f.trunc() as i64))
                .map_or(fallback, Value::Int)
        }
        _ => fallback,
    })
}

fn to_float(v: Value, args: &[Value]) -> Result<Value, String> {
    let fallback = arg(args, 0).cloned().unwrap_or(Value::Float(0.0));
    Ok(match v {
        Value::Int(i) => Value::Float(i as f64),
        Value::Float(f) => Value::Float(f),
        Value::Bool(b) => Value::Float(if b { 1.0 } else { 0.0 }),
        Value::String(s) | Value::Safe(s) => s.trim().parse::<f64>().map_or(fallback, Value::Float),
        _ => fallback,
    })
}

fn to_list(v: Value, _: &[Value]) -> Result<Value, String> {
    match v {
        Value::List(items) => Ok(Value::List(items)),
        Value::Map(m) => Ok(Value::List(m.into_keys().map(Value::String).collect())),
        Value::String(s) | Value::Safe(s) => Ok(Value::List(s.chars().map(|c| Value::String(c.to_string())).collect())),
        Value::Null => Ok(Value::List(Vec::new())),
        other => Err(format!("cannot convert {} to a list", other.type_name())),
    }
}

fn to_dict(v: Value, _: &[Value]) -> Result<Value, String> {
    match v {
        Value::Map(m) => Ok(Value::Map(m)),
        Value::Null => Ok(Value::Map(BTreeMap::new())),
        Value::List(items) => {
            let mut map = BTreeMap::new();
            for item in items {
                match item {
                    Value::List(pair) if pair.len() == 2 => {
                        let mut pair = pair.into_iter();
                        let (k, v) = (pair.next().unwrap_or_default(), pair.next().unwrap_or_default());
                        map.insert(k.to_string(), v);
                    }
                    other => return Err(format!("expected [key, value] pairs, got {}", other.type_name())),
                }
            }
            Ok(Value::Map(map))
        }
        other => Err(format!("cannot convert {} to a map", other.type_name())),
    }
}

fn replace(v: Value, args: &[Value]) -> Result<Value, String> {
    let (Some(old), Some(new)) = (arg(args, 0), arg(args, 1)) else {
        return Err("replace needs two arguments".to_string());
    };
    let (old, new) = (old.to_string(), new.to_string());
    let count = arg(args, 2).and_then(Value::as_i64);
    Ok(map_str(v, |s| match count {
        Some(n) => s.replacen(&old, &new, usize::try_from(n).unwrap_or(0)),
        None => s.replace(&old, &new),
    }))
}

fn truncate(v: Value, args: &[Value]) -> Result<Value, String> {
    let length = arg(args, 0).and_then(Value::as_i64).unwrap_or(255).max(0) as usize;
    let killwords = arg(args, 1).is_some_and(Value::is_truthy);
    let end = arg(args, 2).map_or_else(|| "...".to_string(), ToString::to_string);
    let leeway = arg(args, 3).and_then(Value::as_i64).unwrap_or(5).max(0) as usize;

    Ok(map_str(v, |s| {
        if s.chars().count() <= length + leeway {
            return s.to_string();
        }
        let keep = length.saturating_sub(end.chars().count());
        let cut: String = s.chars().take(keep).collect();
        let cut = if killwords {
            cut.as_str()
        } else {
            cut.rsplit_once(' ').map_or(cut.as_str(), |(head, _)| head)
        };
        format!("{cut}{end}")
    }))
}

/// Widest padding `indent` will insert per line.
const MAX_INDENT: usize = 1024;

fn indent(v: Value, args: &[Value]) -> Result<Value, String> {
    let pad = match arg(args, 0) {
        Some(Value::String(s) | Value::Safe(s)) => s.clone(),
        Some(n) => {
            let width = usize::try_from(n.as_i64().unwrap_or(4).max(0)).unwrap_or(usize::MAX);
            if width > MAX_INDENT {
                return Err("indent width too large".to_string());
            }
            " ".repeat(width)
        }
        None => " ".repeat(4),
    };
    if pad.chars().count() > MAX_INDENT {
        return Err("indent width too large".to_string());
    }
    let first = arg(args, 1).is_some_and(Value::is_truthy);
    Ok(map_str(v, |s| {
        let mut out = String::with_capacity(s.len());
        for (i, line) in s.split_inclusive('\n').enumerate() {
            let blank = line.trim().is_empty();
            if (i > 0 || first) && !blank {
                out.push_str(&pad);
            }
            out.push_str(line);
        }
        out
    }))
}

fn unique(v: Value, _: &[Value]) -> Result<Value, String> {
    let Value::List(items) = v else {
        return Err(format!("cannot deduplicate {}", v.type_name()));
    };
    let mut seen: Vec<Value> = Vec::with_capacity(items.len());
    for item in items {
        if !seen.iter().any(|s| s.loose_eq(&item)) {
            seen.push(item);
        }
    }
    Ok(Value::List(seen))
}

fn extreme(v: Value, wanted: Ordering) -> Result<Value, String> {
    let Value::List(items) = v else {
        return Err(format!("expected a list, got {}", v.type_name()));
    };
    let mut best: Option<Value> = None;
    for item in items {
        best = match best {
            Some(current) if item.compare(&current)? != wanted => Some(current),
            _ => Some(item),
        };
    }
    Ok(best.unwrap_or_default())
}

fn items(v: Value, _: &[Value]) -> Result<Value, String> {
    match v {
        Value::Map(m) => Ok(Value::List(
            m.into_iter().map(|(k, v)| Value::List(vec![Value::String(k), v])).collect(),
        )),
        Value::Null => Ok(Value::List(Vec::new())),
        other => Err(format!("{} has no items", other.type_name())),
    }
}

fn tojson(v: Value, args: &[Value]) -> Result<Value, String> {
    let pretty = arg(args, 0).is_some_and(Value::is_truthy);
    let json = if pretty {
        serde_json::to_string_pretty(&v)
    } else {
        serde_json::to_string(&v)
    }
    .map_err(|e| e.to_string())?;
    // Safe to embed in HTML and inside <script>.
    let json = json
        .replace('<', "\\u003c")
        .replace('>', "\\u003e")
        .replace('&', "\\u0026")
        .replace('\'', "\\u0027");
    Ok(Value::Safe(json))
}

fn integer(v: &Value, test: &str) -> Result<i64, String> {
    v.as_i64()
        .ok_or_else(|| format!("`{test}` needs an integer, got {}", v.type_name()))
}

/// True when the string has at least one cased character and none of the
/// opposite case.
fn cased(v: &Value, is: fn(char) -> bool, opposite: fn(char) -> bool) -> bool {
    v.as_str()
        .is_some_and(|s| s.chars().any(is) && !s.chars().any(opposite))
}
