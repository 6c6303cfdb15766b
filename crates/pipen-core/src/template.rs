//! The template adapter (C3): `render(source, vars) -> Result<String>`.
//!
//! Two back-ends are provided, selected by pipeline config, matching the
//! spec's "two back-ends are typical" note: [`TeraRenderer`], a
//! full-featured Jinja2-style engine (grounded in the `tera` crate, the
//! closest real-world analogue found in the retrieval pack — see
//! `other_examples/a27bac08_jdx-hk__src-step-execution.rs.rs`'s use of a
//! `tera::render` helper), and [`SimpleRenderer`], a minimal `{{var}}` + filter
//! substitution engine for pipelines that don't need full template logic.
//!
//! Filter semantics (`bn`/`fn`/`fn2`/`ext`/`prefix`/`prefix2`/`R`/`Rlist`/
//! quoting filters) are pinned by `original_source/pyppl/templates/template.py`.

use pipen_util::error::PipenError;
use serde_json::Value as Json;
use std::collections::HashMap;
use std::path::Path;

pub trait Renderer: Send + Sync {
    fn render(&self, source: &str, vars: &HashMap<String, Json>) -> Result<String, PipenError>;
}

/// Strip a `[...]` suffix pipen attaches to disambiguate repeated
/// basenames, e.g. `/a/b/c[1].txt` -> `c.txt`, mirroring
/// `pyppl.templates.template._basename`.
fn strip_basename(bn: &str) -> String {
    let (stem, ext) = match bn.rfind('.') {
        Some(i) if i > 0 => (&bn[..i], &bn[i..]),
        _ => (bn, ""),
    };
    if stem.ends_with(']') {
        if let Some(open) = stem.find('[') {
            return format!("{}{}", &stem[..open], ext);
        }
    }
    bn.to_owned()
}

pub fn basename(path: &str, orig: bool) -> String {
    let bn = Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if orig {
        bn
    } else {
        strip_basename(&bn)
    }
}

pub fn filename(path: &str, orig: bool) -> String {
    let bn = basename(path, orig);
    match bn.rfind('.') {
        Some(0) | None => bn,
        Some(i) => bn[..i].to_owned(),
    }
}

pub fn stem2(path: &str, orig: bool) -> String {
    filename(path, orig).split('.').next().unwrap_or("").to_owned()
}

pub fn ext(path: &str) -> String {
    Path::new(path)
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default()
}

pub fn prefix(path: &str, orig: bool) -> String {
    let dir = Path::new(path).parent().map(|p| p.to_string_lossy().into_owned()).unwrap_or_default();
    format!("{dir}/{}", filename(path, orig))
}

pub fn prefix2(path: &str, orig: bool) -> String {
    let dir = Path::new(path).parent().map(|p| p.to_string_lossy().into_owned()).unwrap_or_default();
    format!("{dir}/{}", stem2(path, orig))
}

pub fn dirname(path: &str) -> String {
    Path::new(path).parent().map(|p| p.to_string_lossy().into_owned()).unwrap_or_default()
}

/// `R()`: mirror `pyppl.templates.template._R`, the R-value literal
/// encoder used when `lang` is an R interpreter.
pub fn r_literal(v: &Json) -> String {
    match v {
        Json::Bool(true) => "TRUE".into(),
        Json::Bool(false) => "FALSE".into(),
        Json::Null => "NULL".into(),
        Json::String(s) if s == "NA" || s == "NULL" => s.clone(),
        Json::String(s) if s.starts_with("r:") || s.starts_with("R:") => s[2..].to_owned(),
        Json::String(s) => format!("{s:?}"),
        Json::Number(n) => n.to_string(),
        Json::Array(items) => {
            let inner: Vec<String> = items.iter().map(r_literal).collect();
            format!("c({})", inner.join(", "))
        }
        Json::Object(map) => {
            let inner: Vec<String> = map.iter().map(|(k, v)| format!("{k}={}", r_literal(v))).collect();
            format!("list({})", inner.join(", "))
        }
    }
}

pub fn r_list(v: &Json) -> String {
    match v {
        Json::Array(_) => format!("as.list({})", r_literal(v)),
        _ => r_literal(v),
    }
}

pub fn shell_quote(s: &str) -> String {
    shellwords::escape(s)
}

fn json_quote(v: &Json) -> String {
    serde_json::to_string(v).unwrap_or_default()
}

fn tera_str_arg(v: &Json, name: &str) -> String {
    v.as_str().map(str::to_owned).unwrap_or_else(|| name.to_owned())
}

/// Build a `Tera` instance with pipen's filter set registered. One-shot
/// templates (no template files on disk) use `Tera::one_off`.
pub struct TeraRenderer;

impl TeraRenderer {
    pub fn new() -> Self {
        Self
    }

    fn build() -> tera::Tera {
        let mut tera = tera::Tera::default();
        tera.register_filter("bn", |v: &Json, args: &HashMap<String, Json>| {
            let orig = args.get("orig").and_then(Json::as_bool).unwrap_or(false);
            Ok(Json::String(basename(&tera_str_arg(v, ""), orig)))
        });
        tera.register_filter("basename", |v: &Json, args: &HashMap<String, Json>| {
            let orig = args.get("orig").and_then(Json::as_bool).unwrap_or(false);
            Ok(Json::String(basename(&tera_str_arg(v, ""), orig)))
        });
        tera.register_filter("fn", |v: &Json, args: &HashMap<String, Json>| {
            let orig = args.get("orig").and_then(Json::as_bool).unwrap_or(false);
            Ok(Json::String(filename(&tera_str_arg(v, ""), orig)))
        });
        tera.register_filter("filename", |v: &Json, args: &HashMap<String, Json>| {
            let orig = args.get("orig").and_then(Json::as_bool).unwrap_or(false);
            Ok(Json::String(filename(&tera_str_arg(v, ""), orig)))
        });
        tera.register_filter("fn2", |v: &Json, args: &HashMap<String, Json>| {
            let orig = args.get("orig").and_then(Json::as_bool).unwrap_or(false);
            Ok(Json::String(stem2(&tera_str_arg(v, ""), orig)))
        });
        tera.register_filter("ext", |v: &Json, _: &HashMap<String, Json>| {
            Ok(Json::String(ext(&tera_str_arg(v, ""))))
        });
        tera.register_filter("dirname", |v: &Json, _: &HashMap<String, Json>| {
            Ok(Json::String(dirname(&tera_str_arg(v, ""))))
        });
        tera.register_filter("prefix", |v: &Json, args: &HashMap<String, Json>| {
            let orig = args.get("orig").and_then(Json::as_bool).unwrap_or(false);
            Ok(Json::String(prefix(&tera_str_arg(v, ""), orig)))
        });
        tera.register_filter("prefix2", |v: &Json, args: &HashMap<String, Json>| {
            let orig = args.get("orig").and_then(Json::as_bool).unwrap_or(false);
            Ok(Json::String(prefix2(&tera_str_arg(v, ""), orig)))
        });
        tera.register_filter("realpath", |v: &Json, _: &HashMap<String, Json>| {
            let path = tera_str_arg(v, "");
            let resolved = std::fs::canonicalize(&path)
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or(path);
            Ok(Json::String(resolved))
        });
        tera.register_filter("read", |v: &Json, _: &HashMap<String, Json>| {
            let path = tera_str_arg(v, "");
            std::fs::read_to_string(&path)
                .map(Json::String)
                .map_err(|e| tera::Error::msg(format!("read filter: {e}")))
        });
        tera.register_filter("readlines", |v: &Json, _: &HashMap<String, Json>| {
            let path = tera_str_arg(v, "");
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| tera::Error::msg(format!("readlines filter: {e}")))?;
            Ok(Json::Array(
                contents
                    .lines()
                    .filter(|l| !l.is_empty())
                    .map(|l| Json::String(l.to_owned()))
                    .collect(),
            ))
        });
        tera.register_filter("repr", |v: &Json, _: &HashMap<String, Json>| {
            Ok(Json::String(format!("{v:?}")))
        });
        tera.register_filter("quote", |v: &Json, _: &HashMap<String, Json>| {
            Ok(Json::String(json_quote(v)))
        });
        tera.register_filter("json", |v: &Json, _: &HashMap<String, Json>| {
            Ok(Json::String(json_quote(v)))
        });
        tera.register_filter("squote", |v: &Json, _: &HashMap<String, Json>| {
            let q = json_quote(v);
            Ok(Json::String(format!("'{}'", &q[1..q.len() - 1])))
        });
        tera.register_filter("asquote", |v: &Json, _: &HashMap<String, Json>| {
            let items = v.as_array().cloned().unwrap_or_default();
            Ok(Json::String(items.iter().map(json_quote).collect::<Vec<_>>().join(" ")))
        });
        tera.register_filter("acquote", |v: &Json, _: &HashMap<String, Json>| {
            let items = v.as_array().cloned().unwrap_or_default();
            Ok(Json::String(items.iter().map(json_quote).collect::<Vec<_>>().join(", ")))
        });
        tera.register_filter("shquote", |v: &Json, _: &HashMap<String, Json>| {
            Ok(Json::String(shell_quote(&tera_str_arg(v, ""))))
        });
        tera.register_filter("R", |v: &Json, _: &HashMap<String, Json>| Ok(Json::String(r_literal(v))));
        tera.register_filter("Rlist", |v: &Json, _: &HashMap<String, Json>| Ok(Json::String(r_list(v))));
        tera
    }
}

impl Default for TeraRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Renderer for TeraRenderer {
    fn render(&self, source: &str, vars: &HashMap<String, Json>) -> Result<String, PipenError> {
        let mut tera = Self::build();
        let mut context = tera::Context::new();
        for (k, v) in vars {
            context.insert(k, v);
        }
        tera.render_str(source, &context)
            .map_err(|e| PipenError::TemplateRender(e.to_string()))
    }
}

/// A minimal `{{var}}`/`{{var | filter}}` substitution engine with no
/// control flow, for pipelines configured with `template_engine = "simple"`.
pub struct SimpleRenderer;

impl Renderer for SimpleRenderer {
    fn render(&self, source: &str, vars: &HashMap<String, Json>) -> Result<String, PipenError> {
        let re = regex::Regex::new(r"\{\{\s*([\w.]+)(?:\s*\|\s*(\w+))?\s*\}\}").unwrap();
        let mut out = String::with_capacity(source.len());
        let mut last = 0;
        for caps in re.captures_iter(source) {
            let m = caps.get(0).unwrap();
            out.push_str(&source[last..m.start()]);
            let path = caps.get(1).unwrap().as_str();
            let value = lookup(vars, path)
                .ok_or_else(|| PipenError::TemplateRender(format!("undefined variable {path:?}")))?;
            let rendered = match caps.get(2).map(|m| m.as_str()) {
                Some("bn") | Some("basename") => basename(value.as_str().unwrap_or(""), false),
                Some("fn") | Some("filename") => filename(value.as_str().unwrap_or(""), false),
                Some("ext") => ext(value.as_str().unwrap_or("")),
                Some("dirname") => dirname(value.as_str().unwrap_or("")),
                Some(other) => return Err(PipenError::TemplateRender(format!("unknown filter {other:?}"))),
                None => value.as_str().map(str::to_owned).unwrap_or_else(|| value.to_string()),
            };
            out.push_str(&rendered);
            last = m.end();
        }
        out.push_str(&source[last..]);
        Ok(out)
    }
}

fn lookup<'a>(vars: &'a HashMap<String, Json>, path: &str) -> Option<&'a Json> {
    let mut parts = path.split('.');
    let mut current = vars.get(parts.next()?)?;
    for part in parts {
        current = current.get(part)?;
    }
    Some(current)
}
