//! 参数占位符：{{param}}、{{phase:N}}、{{item}} / {{item.field}}
//!
//! 请求参数在水合时解析；阶段结果与循环元素在执行时解析。

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_.:\-]*)\s*\}\}").expect("valid placeholder regex")
    })
}

/// 占位符引用的对象
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaceholderRef {
    /// 请求参数
    Param(String),
    /// 某个更早阶段的结果
    PhaseResult(u32),
    /// 当前循环元素（可选字段）
    Item(Option<String>),
}

impl PlaceholderRef {
    pub fn parse(name: &str) -> PlaceholderRef {
        if let Some(n) = name.strip_prefix("phase:") {
            if let Ok(n) = n.parse::<u32>() {
                return PlaceholderRef::PhaseResult(n);
            }
        }
        if name == "item" {
            return PlaceholderRef::Item(None);
        }
        if let Some(field) = name.strip_prefix("item.") {
            return PlaceholderRef::Item(Some(field.to_string()));
        }
        PlaceholderRef::Param(name.to_string())
    }

    pub fn is_runtime(&self) -> bool {
        !matches!(self, PlaceholderRef::Param(_))
    }
}

/// 收集 JSON 值中出现的所有占位符名（去重，按出现顺序）
pub fn placeholders_in(value: &Value) -> Vec<String> {
    let mut names = Vec::new();
    collect(value, &mut names);
    names
}

fn collect(value: &Value, names: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            for cap in placeholder_regex().captures_iter(s) {
                let name = cap[1].to_string();
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect(v, names)),
        Value::Object(map) => map.values().for_each(|v| collect(v, names)),
        _ => {}
    }
}

/// 替换占位符；resolve 返回 None 的占位符原样保留。
/// 整个字符串恰为一个占位符时直接替换为解析出的 JSON 值（保留类型），否则按文本插值。
pub fn substitute(value: &Value, resolve: &mut dyn FnMut(&str) -> Option<Value>) -> Value {
    match value {
        Value::String(s) => substitute_str(s, resolve),
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute(v, &mut *resolve)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute(v, &mut *resolve)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn substitute_str(s: &str, resolve: &mut dyn FnMut(&str) -> Option<Value>) -> Value {
    let re = placeholder_regex();
    if let Some(cap) = re.captures(s) {
        if cap[0].len() == s.len() {
            return resolve(&cap[1]).unwrap_or_else(|| Value::String(s.to_string()));
        }
    }
    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    for cap in re.captures_iter(s) {
        let whole = match cap.get(0) {
            Some(m) => m,
            None => continue,
        };
        out.push_str(&s[last..whole.start()]);
        match resolve(&cap[1]) {
            Some(Value::String(text)) => out.push_str(&text),
            Some(other) => out.push_str(&other.to_string()),
            None => out.push_str(whole.as_str()),
        }
        last = whole.end();
    }
    out.push_str(&s[last..]);
    Value::String(out)
}

/// 将占位符名包装为模板文本
pub fn placeholder(name: &str) -> String {
    format!("{{{{{name}}}}}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_refs() {
        assert_eq!(PlaceholderRef::parse("phase:2"), PlaceholderRef::PhaseResult(2));
        assert_eq!(PlaceholderRef::parse("item"), PlaceholderRef::Item(None));
        assert_eq!(
            PlaceholderRef::parse("item.name"),
            PlaceholderRef::Item(Some("name".to_string()))
        );
        assert_eq!(
            PlaceholderRef::parse("database"),
            PlaceholderRef::Param("database".to_string())
        );
    }

    #[test]
    fn test_placeholders_in_nested_values() {
        let v = json!({"a": "{{x}} and {{ y }}", "b": ["{{x}}", 3], "c": {"d": "{{phase:1}}"}});
        let names = placeholders_in(&v);
        assert_eq!(names.len(), 3);
        assert!(names.contains(&"phase:1".to_string()));
    }

    #[test]
    fn test_substitute_whole_value_keeps_type() {
        let v = json!({"rows": "{{phase:1}}", "label": "db={{database}}", "other": "{{unknown}}"});
        let out = substitute(&v, &mut |name: &str| match name {
            "phase:1" => Some(json!([1, 2])),
            "database" => Some(json!("sales")),
            _ => None,
        });
        assert_eq!(out, json!({"rows": [1, 2], "label": "db=sales", "other": "{{unknown}}"}));
    }

    #[test]
    fn test_placeholder_formatting() {
        assert_eq!(placeholder("database"), "{{database}}");
    }
}
