//! Logic-less template rendering over a nested variable context.
//!
//! The engine surface is fixed: dotted paths, `#each`, `#if`/`else`,
//! `isTruthy`, `eq`, `now` and `formatDate`. Rendering never fails outward:
//! an engine error returns the original template text.

use chrono::{DateTime, Utc};
use handlebars::{
    Context, Handlebars, Helper, HelperDef, HelperResult, Output, RenderContext, RenderError,
    Renderable, ScopedJson,
};
use serde_json::Value as JsonValue;

/// Uppercase date tokens accepted in template patterns, mapped onto the
/// engine's format specifiers. `YYYY` must be substituted before `YY`.
const DATE_TOKEN_MAP: &[(&str, &str)] = &[
    ("YYYY", "%Y"),
    ("YY", "%y"),
    ("DD", "%d"),
    ("MM", "%m"),
    ("HH", "%H"),
    ("mm", "%M"),
    ("ss", "%S"),
];

/// Translate a template date pattern (`DD/MM/YYYY`) into a strftime pattern.
///
/// Tokens are replaced through placeholders so earlier substitutions cannot
/// corrupt later ones.
pub fn map_date_pattern(pattern: &str) -> String {
    let mut mapped = pattern.to_string();
    for (index, (token, _)) in DATE_TOKEN_MAP.iter().enumerate() {
        mapped = mapped.replace(token, &format!("\u{1}{index}\u{2}"));
    }
    for (index, (_, strftime)) in DATE_TOKEN_MAP.iter().enumerate() {
        mapped = mapped.replace(&format!("\u{1}{index}\u{2}"), strftime);
    }
    mapped
}

/// Accept both helper surfaces for the clock: rewrite `{{now:PATTERN}}` to
/// `{{now "PATTERN"}}` before evaluation.
fn rewrite_now_shorthand(template: &str) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{now:") {
        let after = &rest[start + 6..];
        match after.find("}}") {
            Some(end) => {
                out.push_str(&rest[..start]);
                out.push_str("{{now \"");
                out.push_str(after[..end].trim());
                out.push_str("\"}}");
                rest = &after[end + 2..];
            }
            None => break,
        }
    }
    out.push_str(rest);
    out
}

/// The `{{isTruthy x}} ... {{/isTruthy}}` surface is block-shaped without
/// the `#` marker; normalize it for the engine.
fn rewrite_is_truthy_blocks(template: &str) -> String {
    template
        .replace("{{#isTruthy", "\u{1}KEEP\u{2}")
        .replace("{{isTruthy", "{{#isTruthy")
        .replace("\u{1}KEEP\u{2}", "{{#isTruthy")
}

/// Rewrite `{{list.length}}` paths into the engine's `len` helper.
fn rewrite_length_paths(template: &str) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        let Some(end) = rest[start..].find("}}") else {
            break;
        };
        let inner = &rest[start + 2..start + end];
        let trimmed = inner.trim();
        let is_plain_path = !trimmed.is_empty()
            && !trimmed.contains(char::is_whitespace)
            && !trimmed.starts_with(['#', '/', '^', '!', '>']);
        if is_plain_path && trimmed.ends_with(".length") {
            out.push_str(&rest[..start]);
            out.push_str("{{len ");
            out.push_str(&trimmed[..trimmed.len() - ".length".len()]);
            out.push_str("}}");
        } else {
            out.push_str(&rest[..start + end + 2]);
        }
        rest = &rest[start + end + 2..];
    }
    out.push_str(rest);
    out
}

pub fn preprocess(template: &str) -> String {
    rewrite_length_paths(&rewrite_is_truthy_blocks(&rewrite_now_shorthand(template)))
}

/// Falsy per the explicit truthiness helper: null, empty, and the string
/// forms "null", "false", "0" (case-insensitive).
fn is_falsy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::Bool(b) => !b,
        JsonValue::Number(n) => n.as_f64() == Some(0.0),
        JsonValue::String(s) => {
            s.is_empty()
                || s.eq_ignore_ascii_case("null")
                || s.eq_ignore_ascii_case("false")
                || s == "0"
        }
        JsonValue::Array(items) => items.is_empty(),
        JsonValue::Object(map) => map.is_empty(),
    }
}

fn value_as_text(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s.clone(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

fn now_helper(
    h: &Helper,
    _r: &Handlebars,
    _ctx: &Context,
    _rc: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let pattern = h
        .param(0)
        .and_then(|p| p.value().as_str())
        .unwrap_or("DD/MM/YYYY");
    let formatted = Utc::now().format(&map_date_pattern(pattern)).to_string();
    out.write(&formatted)?;
    Ok(())
}

fn parse_date_like(value: &JsonValue) -> Option<DateTime<Utc>> {
    match value {
        JsonValue::String(raw) => DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        JsonValue::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}

fn format_date_helper(
    h: &Helper,
    _r: &Handlebars,
    _ctx: &Context,
    _rc: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let value = h.param(0).map(|p| p.value().clone()).unwrap_or(JsonValue::Null);
    let pattern = h
        .param(1)
        .and_then(|p| p.value().as_str())
        .unwrap_or("DD/MM/YYYY");
    match parse_date_like(&value) {
        Some(dt) => out.write(&dt.format(&map_date_pattern(pattern)).to_string())?,
        None => out.write(&value_as_text(&value))?,
    }
    Ok(())
}

struct IsTruthyHelper;

impl HelperDef for IsTruthyHelper {
    fn call<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        r: &'reg Handlebars<'reg>,
        ctx: &'rc Context,
        rc: &mut RenderContext<'reg, 'rc>,
        out: &mut dyn Output,
    ) -> HelperResult {
        let value = h.param(0).map(|p| p.value().clone()).unwrap_or(JsonValue::Null);
        let section = if is_falsy(&value) {
            h.inverse()
        } else {
            h.template()
        };
        if let Some(template) = section {
            template.render(r, ctx, rc, out)?;
        }
        Ok(())
    }
}

/// Case-insensitive string equality, usable inline, as a block condition and
/// as an `#if` subexpression.
struct EqHelper;

impl EqHelper {
    fn params_equal(h: &Helper) -> bool {
        let a = h.param(0).map(|p| value_as_text(p.value())).unwrap_or_default();
        let b = h.param(1).map(|p| value_as_text(p.value())).unwrap_or_default();
        a.eq_ignore_ascii_case(&b)
    }
}

impl HelperDef for EqHelper {
    fn call_inner<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        _r: &'reg Handlebars<'reg>,
        _ctx: &'rc Context,
        _rc: &mut RenderContext<'reg, 'rc>,
    ) -> Result<ScopedJson<'rc>, RenderError> {
        Ok(ScopedJson::Derived(JsonValue::Bool(Self::params_equal(h))))
    }

    fn call<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        r: &'reg Handlebars<'reg>,
        ctx: &'rc Context,
        rc: &mut RenderContext<'reg, 'rc>,
        out: &mut dyn Output,
    ) -> HelperResult {
        let equal = Self::params_equal(h);
        if h.is_block() {
            let section = if equal { h.template() } else { h.inverse() };
            if let Some(template) = section {
                template.render(r, ctx, rc, out)?;
            }
        } else {
            out.write(if equal { "true" } else { "false" })?;
        }
        Ok(())
    }
}

/// Collection length, the target of the `{{list.length}}` path rewrite.
struct LenHelper;

impl HelperDef for LenHelper {
    fn call_inner<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        _r: &'reg Handlebars<'reg>,
        _ctx: &'rc Context,
        _rc: &mut RenderContext<'reg, 'rc>,
    ) -> Result<ScopedJson<'rc>, RenderError> {
        let length = match h.param(0).map(|p| p.value()) {
            Some(JsonValue::Array(items)) => items.len(),
            Some(JsonValue::Object(map)) => map.len(),
            Some(JsonValue::String(s)) => s.chars().count(),
            _ => 0,
        };
        Ok(ScopedJson::Derived(JsonValue::from(length)))
    }
}

pub struct TemplateRenderer {
    engine: Handlebars<'static>,
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateRenderer {
    pub fn new() -> Self {
        let mut engine = Handlebars::new();
        engine.register_helper("now", Box::new(now_helper));
        engine.register_helper("formatDate", Box::new(format_date_helper));
        engine.register_helper("isTruthy", Box::new(IsTruthyHelper));
        engine.register_helper("eq", Box::new(EqHelper));
        engine.register_helper("len", Box::new(LenHelper));
        Self { engine }
    }

    /// Render against the context. Missing paths render empty; any engine
    /// error is logged and the original template text comes back.
    pub fn render(&self, template: &str, context: &JsonValue) -> String {
        let prepared = preprocess(template);
        match self.engine.render_template(&prepared, context) {
            Ok(rendered) => rendered,
            Err(e) => {
                tracing::warn!(error = %e, "Template rendering failed, returning raw template");
                template.to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn renderer() -> TemplateRenderer {
        TemplateRenderer::new()
    }

    #[test]
    fn test_dotted_path_lookup() {
        let ctx = json!({"data": {"id_purchase_order": 1021, "supplier_name": "ACME"}});
        let out = renderer().render(
            "Order {{data.id_purchase_order}} from {{data.supplier_name}}",
            &ctx,
        );
        assert_eq!(out, "Order 1021 from ACME");
    }

    #[test]
    fn test_missing_path_renders_empty() {
        let out = renderer().render("[{{data.absent.deep}}]", &json!({}));
        assert_eq!(out, "[]");
    }

    #[test]
    fn test_each_iterates_with_item_as_root() {
        let ctx = json!({"lines": [{"sku": "A"}, {"sku": "B"}]});
        let out = renderer().render("{{#each lines}}{{sku}};{{/each}}", &ctx);
        assert_eq!(out, "A;B;");
    }

    #[test]
    fn test_nested_each() {
        let ctx = json!({"orders": [
            {"code": "O1", "lines": [{"q": 1}, {"q": 2}]},
            {"code": "O2", "lines": [{"q": 3}]}
        ]});
        let out = renderer().render(
            "{{#each orders}}{{code}}:{{#each lines}}{{q}},{{/each}} {{/each}}",
            &ctx,
        );
        assert_eq!(out, "O1:1,2, O2:3, ");
    }

    #[test]
    fn test_list_length_surface() {
        let ctx = json!({"lines": [1, 2, 3]});
        let out = renderer().render("{{#each lines}}{{this}}{{/each}} n={{lines.length}}", &ctx);
        assert_eq!(out, "123 n=3");
    }

    #[test]
    fn test_length_of_missing_or_empty_list_is_zero() {
        assert_eq!(renderer().render("{{lines.length}}", &json!({"lines": []})), "0");
        assert_eq!(renderer().render("{{lines.length}}", &json!({})), "0");
    }

    #[test]
    fn test_if_else() {
        let ctx = json!({"urgent": true});
        assert_eq!(
            renderer().render("{{#if urgent}}NOW{{else}}later{{/if}}", &ctx),
            "NOW"
        );
        assert_eq!(
            renderer().render("{{#if missing}}NOW{{else}}later{{/if}}", &ctx),
            "later"
        );
    }

    #[test]
    fn test_is_truthy_falsy_forms() {
        let template = "{{isTruthy v}}yes{{else}}no{{/isTruthy}}";
        for falsy in [
            json!(null),
            json!(""),
            json!("null"),
            json!("NULL"),
            json!("false"),
            json!("FALSE"),
            json!("0"),
            json!(false),
        ] {
            let out = renderer().render(template, &json!({ "v": falsy }));
            assert_eq!(out, "no", "value should be falsy");
        }
        for truthy in [json!("x"), json!(1), json!("1"), json!(true), json!("ok")] {
            let out = renderer().render(template, &json!({ "v": truthy }));
            assert_eq!(out, "yes", "value should be truthy");
        }
    }

    #[test]
    fn test_eq_is_case_insensitive() {
        let ctx = json!({"status": "Sent"});
        assert_eq!(renderer().render("{{eq status \"SENT\"}}", &ctx), "true");
        assert_eq!(renderer().render("{{eq status \"failed\"}}", &ctx), "false");
        assert_eq!(
            renderer().render("{{#if (eq status \"sent\")}}done{{/if}}", &ctx),
            "done"
        );
        assert_eq!(
            renderer().render("{{#eq status \"sent\"}}done{{else}}not{{/eq}}", &ctx),
            "done"
        );
    }

    #[test]
    fn test_now_renders_current_date() {
        let out = renderer().render("{{now \"DD/MM/YYYY\"}}", &json!({}));
        let expected = Utc::now().format("%d/%m/%Y").to_string();
        assert_eq!(out, expected);
    }

    #[test]
    fn test_now_shorthand_form() {
        let out = renderer().render("{{now:YYYY}}", &json!({}));
        assert_eq!(out, Utc::now().format("%Y").to_string());
    }

    #[test]
    fn test_two_digit_year() {
        let out = renderer().render("{{now \"YY\"}}", &json!({}));
        assert_eq!(out, Utc::now().format("%y").to_string());
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_pattern_mapping_order() {
        // YYYY must map as a whole, not as YY+YY.
        assert_eq!(map_date_pattern("YYYY"), "%Y");
        assert_eq!(map_date_pattern("YY"), "%y");
        assert_eq!(map_date_pattern("DD/MM/YYYY HH:mm:ss"), "%d/%m/%Y %H:%M:%S");
        assert_eq!(map_date_pattern("YYYY-MM-DD"), "%Y-%m-%d");
    }

    #[test]
    fn test_format_date_helper() {
        let ctx = json!({"ts": "2026-02-04T10:30:45Z", "ms": 1_700_000_000_000i64});
        assert_eq!(
            renderer().render("{{formatDate ts \"DD/MM/YYYY\"}}", &ctx),
            "04/02/2026"
        );
        assert_eq!(
            renderer().render("{{formatDate ts \"HH:mm:ss\"}}", &ctx),
            "10:30:45"
        );
        // epoch millis input
        assert_eq!(
            renderer().render("{{formatDate ms \"YYYY\"}}", &ctx),
            "2023"
        );
        // unparseable input falls back to the raw text
        assert_eq!(
            renderer().render("{{formatDate v \"YYYY\"}}", &json!({"v": "soon"})),
            "soon"
        );
    }

    #[test]
    fn test_render_error_returns_original_template() {
        let broken = "{{#each lines}}no closing tag";
        let out = renderer().render(broken, &json!({"lines": []}));
        assert_eq!(out, broken);
    }

    #[test]
    fn test_referenced_values_appear_once_per_occurrence() {
        let ctx = json!({"a": {"b": "X"}, "c": 7});
        let out = renderer().render("{{a.b}}-{{c}}-{{a.b}}", &ctx);
        assert_eq!(out, "X-7-X");
    }
}
