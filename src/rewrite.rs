//! In-flight rewriting of backend replies
//!
//! The backend's client asks for page templates over the socket with
//! `["template", "<path>"]` and receives `[{"html": ..., "success": ...}]`.
//! Rules keyed by that path swap the login and admin forms for our own
//! fragments. World info replies get their invite links pointed at the
//! public port.

use crate::config::TemplateConfig;
use crate::markup::{Document, ROOT};
use crate::wire::WireMessage;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use tracing::{debug, warn};

static VARIABLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("valid variable regex"));

/// Values available to injected fragments
#[derive(Debug, Clone, Default)]
pub struct FragmentContext {
    pub slug: String,
    pub name: String,
    pub display_name: String,
    /// Public base path of the instance, e.g. `/vtt/alice`
    pub base_url: String,
    pub management_prefix: String,
}

impl FragmentContext {
    fn lookup(&self, key: &str) -> Option<&str> {
        Some(match key {
            "slug" => &self.slug,
            "name" => &self.name,
            "display_name" => &self.display_name,
            "base_url" => &self.base_url,
            "management_prefix" => &self.management_prefix,
            _ => return None,
        })
    }
}

/// Renders a named fragment template into markup
pub trait FragmentRenderer: Send + Sync {
    fn render(&self, name: &str, context: &FragmentContext) -> anyhow::Result<String>;
}

fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Fragment templates loaded from a directory.
///
/// `{{ key }}` is replaced with the escaped context value. Expressions that
/// name no context key are left for the browser-side template engine.
pub struct TemplateDir {
    dir: PathBuf,
}

impl TemplateDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl FragmentRenderer for TemplateDir {
    fn render(&self, name: &str, context: &FragmentContext) -> anyhow::Result<String> {
        if name.contains("..") {
            anyhow::bail!("Invalid template name: {}", name);
        }
        let path = self.dir.join(name);
        let source = std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("Failed to read template {}: {}", path.display(), e))?;

        Ok(VARIABLE
            .replace_all(&source, |caps: &regex::Captures| match context.lookup(&caps[1]) {
                Some(value) => escape_html(value),
                None => caps[0].to_string(),
            })
            .into_owned())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RewriteRule {
    /// Replace the children of exactly one matching element with the
    /// fragment, keeping its direct `h2` header children
    Splice {
        fragment: String,
        tag: String,
        attrs: Vec<(String, String)>,
        limit: Option<usize>,
    },
    /// Replace the whole template with the fragment
    Replace { fragment: String },
}

/// Everything a rewrite needs to know about the instance being served
#[derive(Debug, Clone, Default)]
pub struct RewriteContext {
    pub fragment: FragmentContext,
    pub backend_port: u16,
    pub public_port: u16,
}

pub struct RewriteEngine {
    rules: HashMap<String, RewriteRule>,
    renderer: Arc<dyn FragmentRenderer>,
}

fn splice(fragment: &str, tag: &str, limit: Option<usize>, attrs: &[(String, String)]) -> RewriteRule {
    RewriteRule::Splice {
        fragment: fragment.to_string(),
        tag: tag.to_string(),
        attrs: attrs.to_vec(),
        limit,
    }
}

/// The template rules for every supported backend generation
pub fn standard_rules(templates: &TemplateConfig) -> HashMap<String, RewriteRule> {
    let login = templates.login_fragment.as_str();
    let admin = templates.admin_fragment.as_str();
    let class = |value: &str| vec![("class".to_string(), value.to_string())];

    let mut rules = HashMap::new();
    // v8 to v10
    rules.insert(
        "templates/setup/join-game.html".to_string(),
        splice(login, "div", Some(1), &class("app")),
    );
    // v11
    rules.insert(
        "templates/setup/join-game.hbs".to_string(),
        splice(login, "div", None, &class("join-form")),
    );
    rules.insert(
        "templates/setup/join-setup.html".to_string(),
        splice(admin, "div", None, &class("join-form")),
    );
    // v12+
    rules.insert(
        "templates/setup/parts/join-form.hbs".to_string(),
        RewriteRule::Replace {
            fragment: login.to_string(),
        },
    );
    rules.insert(
        "templates/setup/parts/join-setup.hbs".to_string(),
        RewriteRule::Replace {
            fragment: admin.to_string(),
        },
    );
    rules
}

impl RewriteEngine {
    pub fn new(rules: HashMap<String, RewriteRule>, renderer: Arc<dyn FragmentRenderer>) -> Self {
        Self { rules, renderer }
    }

    pub fn standard(templates: &TemplateConfig) -> Self {
        Self::new(
            standard_rules(templates),
            Arc::new(TemplateDir::new(templates.dir.clone())),
        )
    }

    /// Rewrite a reply given the data of the request it answers.
    /// None leaves the reply untouched.
    pub fn rewrite(
        &self,
        response: &WireMessage,
        request: &[Value],
        context: &RewriteContext,
    ) -> Option<WireMessage> {
        match request.first()?.as_str()? {
            "template" => self.rewrite_template(response, request.get(1)?.as_str()?, context),
            "world" => rewrite_world(response, context),
            _ => None,
        }
    }

    fn rewrite_template(
        &self,
        response: &WireMessage,
        subject: &str,
        context: &RewriteContext,
    ) -> Option<WireMessage> {
        let rule = self.rules.get(subject)?;
        let html = response.data()?.first()?.get("html")?.as_str()?;
        if html.is_empty() {
            return None;
        }

        let fragment_name = match rule {
            RewriteRule::Splice { fragment, .. } | RewriteRule::Replace { fragment } => fragment,
        };
        let rendered = match self.renderer.render(fragment_name, &context.fragment) {
            Ok(rendered) => rendered,
            Err(e) => {
                warn!(subject, fragment = %fragment_name, error = %e, "Failed to render fragment");
                return None;
            }
        };

        let rewritten = match rule {
            RewriteRule::Replace { .. } => rendered,
            RewriteRule::Splice { tag, attrs, limit, .. } => {
                splice_fragment(html, &rendered, tag, attrs, *limit)?
            }
        };
        if rewritten == html {
            return None;
        }

        debug!(subject, slug = %context.fragment.slug, "Rewrote template");
        let mut message = response.clone();
        let first = message.data_mut()?.first_mut()?.as_object_mut()?;
        first.insert("html".to_string(), Value::String(rewritten));
        Some(message)
    }
}

/// Splice `fragment` into the single element matching the search.
/// None when there is not exactly one match.
fn splice_fragment(
    html: &str,
    fragment: &str,
    tag: &str,
    attrs: &[(String, String)],
    limit: Option<usize>,
) -> Option<String> {
    let mut page = Document::parse(html);
    let needles: Vec<(&str, &str)> = attrs.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
    let found = page.search(ROOT, tag, &needles, limit, None);
    let [target] = found.as_slice() else {
        debug!(tag, matches = found.len(), "Splice target not unique, leaving template alone");
        return None;
    };
    let target = *target;

    let headers: Vec<_> = page
        .children(target)
        .iter()
        .copied()
        .filter(|child| page.element(*child).is_some_and(|e| e.tag() == "h2"))
        .collect();
    page.clear_children(target);
    for header in headers {
        page.append_child(target, header);
    }
    page.append_fragment(target, &Document::parse(fragment));

    Some(page.to_string())
}

fn amend_invite_url(url: &str, backend_port: u16, public_port: u16) -> String {
    let private = format!(":{backend_port}");
    match url.find(&private) {
        Some(start) => {
            let end = start + private.len();
            let boundary = url[end..].chars().next().map_or(true, |c| !c.is_ascii_digit());
            if boundary {
                format!("{}:{}{}", &url[..start], public_port, &url[end..])
            } else {
                url.to_string()
            }
        }
        None => url.to_string(),
    }
}

fn rewrite_world(response: &WireMessage, context: &RewriteContext) -> Option<WireMessage> {
    if context.backend_port == 0 || context.backend_port == context.public_port {
        return None;
    }
    let mut message = response.clone();
    let addresses = message
        .data_mut()?
        .first_mut()?
        .get_mut("addresses")?
        .as_object_mut()?;

    let mut changed = false;
    for key in ["local", "remote"] {
        if let Some(Value::String(url)) = addresses.get_mut(key) {
            let amended = amend_invite_url(url, context.backend_port, context.public_port);
            if amended != *url {
                *url = amended;
                changed = true;
            }
        }
    }
    changed.then_some(message)
}

fn truthy(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "on" | "true" | "1" | "yes")
}

/// Look for an EULA acceptance in a request the client sends to the backend.
/// `fields` are the decoded form or JSON fields of the body.
pub fn observe_eula_acceptance(backend_path: &str, fields: &HashMap<String, String>) -> bool {
    backend_path.trim_matches('/').eq_ignore_ascii_case("license") && fields.get("accept").is_some_and(|v| truthy(v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{decode, encode};
    use serde_json::json;

    struct StaticRenderer(&'static str);

    impl FragmentRenderer for StaticRenderer {
        fn render(&self, _name: &str, context: &FragmentContext) -> anyhow::Result<String> {
            Ok(self.0.replace("SLUG", &context.slug))
        }
    }

    struct FailingRenderer;

    impl FragmentRenderer for FailingRenderer {
        fn render(&self, name: &str, _context: &FragmentContext) -> anyhow::Result<String> {
            anyhow::bail!("no template {}", name)
        }
    }

    fn engine(fragment: &'static str) -> RewriteEngine {
        RewriteEngine::new(
            standard_rules(&TemplateConfig::default()),
            Arc::new(StaticRenderer(fragment)),
        )
    }

    fn context() -> RewriteContext {
        RewriteContext {
            fragment: FragmentContext {
                slug: "alice".to_string(),
                base_url: "/vtt/alice".to_string(),
                ..Default::default()
            },
            backend_port: 30000,
            public_port: 8080,
        }
    }

    fn template_reply(html: &str) -> WireMessage {
        decode(&format!("432{}", json!([{"html": html, "success": true}]))).unwrap()
    }

    fn html_of(message: &WireMessage) -> String {
        message.data().unwrap()[0]["html"].as_str().unwrap().to_string()
    }

    const JOIN_FORM: &str = r#"<div class="join-form"><h2>{{localize "GAME.Join"}}</h2> <form><input name="password"></form></div>"#;

    #[test]
    fn test_splice_keeps_headers_and_other_fields() {
        let engine = engine(r#"<a class="login" href="/manage/login?next=SLUG">Log in</a>"#);
        let request = vec![json!("template"), json!("templates/setup/join-game.hbs")];

        let rewritten = engine.rewrite(&template_reply(JOIN_FORM), &request, &context()).unwrap();
        assert_eq!(
            html_of(&rewritten),
            r#"<div class="join-form"><h2>{{localize "GAME.Join"}}</h2><a class="login" href="/manage/login?next=alice">Log in</a></div>"#
        );
        assert_eq!(rewritten.data().unwrap()[0]["success"], json!(true));
        assert_eq!(rewritten.id, Some(2));
    }

    #[test]
    fn test_second_pass_is_noop() {
        let engine = engine(r#"<a class="login">Log in</a>"#);
        let request = vec![json!("template"), json!("templates/setup/join-game.hbs")];
        let ctx = context();

        let first = engine.rewrite(&template_reply(JOIN_FORM), &request, &ctx).unwrap();
        assert!(engine.rewrite(&first, &request, &ctx).is_none());

        let replace = vec![json!("template"), json!("templates/setup/parts/join-form.hbs")];
        let replaced = engine.rewrite(&template_reply("<form></form>"), &replace, &ctx).unwrap();
        assert!(engine.rewrite(&replaced, &replace, &ctx).is_none());
    }

    #[test]
    fn test_replace_rule_swaps_whole_template() {
        let engine = engine("<button>SLUG</button>");
        let request = vec![json!("template"), json!("templates/setup/parts/join-setup.hbs")];

        let rewritten = engine.rewrite(&template_reply("<form>admin</form>"), &request, &context()).unwrap();
        assert_eq!(html_of(&rewritten), "<button>alice</button>");
    }

    #[test]
    fn test_unknown_subject_or_verb_is_untouched() {
        let engine = engine("<b>x</b>");
        let reply = template_reply(JOIN_FORM);
        let ctx = context();

        assert!(engine
            .rewrite(&reply, &[json!("template"), json!("templates/other.hbs")], &ctx)
            .is_none());
        assert!(engine.rewrite(&reply, &[json!("getJoinData")], &ctx).is_none());
        assert!(engine.rewrite(&reply, &[], &ctx).is_none());
    }

    #[test]
    fn test_ambiguous_splice_target_is_untouched() {
        let engine = engine("<b>x</b>");
        let request = vec![json!("template"), json!("templates/setup/join-game.hbs")];
        let two = r#"<div class="join-form"></div><div class="join-form"></div>"#;
        assert!(engine.rewrite(&template_reply(two), &request, &context()).is_none());
        assert!(engine.rewrite(&template_reply("<p>none</p>"), &request, &context()).is_none());
    }

    #[test]
    fn test_limited_search_takes_first_match() {
        let engine = engine("<b>x</b>");
        let request = vec![json!("template"), json!("templates/setup/join-game.html")];
        let page = r#"<div class="app outer"><div class="app inner">old</div></div>"#;

        let rewritten = engine.rewrite(&template_reply(page), &request, &context()).unwrap();
        assert_eq!(html_of(&rewritten), r#"<div class="app outer"><b>x</b></div>"#);
    }

    #[test]
    fn test_render_failure_leaves_payload() {
        let engine = RewriteEngine::new(standard_rules(&TemplateConfig::default()), Arc::new(FailingRenderer));
        let request = vec![json!("template"), json!("templates/setup/parts/join-form.hbs")];
        assert!(engine.rewrite(&template_reply("<form></form>"), &request, &context()).is_none());
    }

    #[test]
    fn test_world_invite_urls_use_public_port() {
        let engine = engine("");
        let reply = decode(&format!(
            "433{}",
            json!([{"id": "w1", "addresses": {
                "local": "http://192.168.1.4:30000/vtt/alice",
                "remote": "http://203.0.113.9:30000/vtt/alice/join"
            }}])
        ))
        .unwrap();

        let rewritten = engine.rewrite(&reply, &[json!("world")], &context()).unwrap();
        let addresses = &rewritten.data().unwrap()[0]["addresses"];
        assert_eq!(addresses["local"], "http://192.168.1.4:8080/vtt/alice");
        assert_eq!(addresses["remote"], "http://203.0.113.9:8080/vtt/alice/join");
        assert!(encode(&rewritten).starts_with(r#"433[{"id":"w1","#));
    }

    #[test]
    fn test_invite_url_port_boundary() {
        assert_eq!(amend_invite_url("http://h:300001/x", 30000, 80), "http://h:300001/x");
        assert_eq!(amend_invite_url("http://h:30000", 30000, 80), "http://h:80");
        assert_eq!(amend_invite_url("http://h/x", 30000, 80), "http://h/x");
    }

    #[test]
    fn test_template_dir_substitutes_known_keys() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("login.html"),
            r#"<a href="{{ base_url }}/../{{management_prefix}}">{{ display_name }}</a>{{localize "X"}}"#,
        )
        .unwrap();

        let renderer = TemplateDir::new(dir.path());
        let ctx = FragmentContext {
            display_name: "Tom & Jerry's <Game>".to_string(),
            base_url: "/vtt/tj".to_string(),
            management_prefix: "manage".to_string(),
            ..Default::default()
        };
        let html = renderer.render("login.html", &ctx).unwrap();
        assert_eq!(
            html,
            r#"<a href="/vtt/tj/../manage">Tom &amp; Jerry&#39;s &lt;Game&gt;</a>{{localize "X"}}"#
        );

        assert!(renderer.render("missing.html", &ctx).is_err());
        assert!(renderer.render("../secret", &ctx).is_err());
    }

    #[test]
    fn test_observe_eula_acceptance() {
        let mut fields = HashMap::new();
        fields.insert("accept".to_string(), "on".to_string());
        assert!(observe_eula_acceptance("license", &fields));
        assert!(observe_eula_acceptance("/license/", &fields));
        assert!(observe_eula_acceptance("License", &fields));
        assert!(!observe_eula_acceptance("setup", &fields));

        fields.insert("accept".to_string(), "false".to_string());
        assert!(!observe_eula_acceptance("license", &fields));
        assert!(!observe_eula_acceptance("license", &HashMap::new()));
    }
}
