//! Message rendering seam.
//!
//! Rendering happens once, when the scheduler materializes a job. The
//! surrounding application may plug in its own template engine through
//! [`MessageRenderer`]; the bundled renderer understands `{{variable}}`
//! placeholders only.

use std::collections::HashMap;

use crate::error::{CampaignError, CampaignResult};
use crate::types::{CampaignStep, Lead};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub subject: String,
    pub body_html: String,
}

pub trait MessageRenderer: Send + Sync {
    fn render(&self, step: &CampaignStep, lead: &Lead) -> CampaignResult<RenderedMessage>;
}

/// `{{variable}}` substitution against [`Lead::template_variables`].
///
/// Unknown variables render as empty strings unless the renderer is strict,
/// in which case they fail the render so the job is never created.
#[derive(Debug, Clone, Default)]
pub struct PlaceholderRenderer {
    strict: bool,
}

impl PlaceholderRenderer {
    pub fn new() -> Self {
        Self { strict: false }
    }

    pub fn strict() -> Self {
        Self { strict: true }
    }

    pub fn render_str(&self, template: &str, variables: &HashMap<String, String>) -> CampaignResult<String> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find("}}") else {
                // Unterminated placeholder, keep it verbatim.
                out.push_str(&rest[start..]);
                return Ok(out);
            };
            let name = after[..end].trim();
            match variables.get(name) {
                Some(value) => out.push_str(value),
                None if self.strict => {
                    return Err(CampaignError::Render(format!("unknown template variable '{name}'")));
                }
                None => {}
            }
            rest = &after[end + 2..];
        }
        out.push_str(rest);
        Ok(out)
    }
}

impl MessageRenderer for PlaceholderRenderer {
    fn render(&self, step: &CampaignStep, lead: &Lead) -> CampaignResult<RenderedMessage> {
        let vars = lead.template_variables();
        Ok(RenderedMessage {
            subject: self.render_str(&step.subject_template, &vars)?,
            body_html: self.render_str(&step.body_template, &vars)?,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn vars() -> HashMap<String, String> {
        let mut v = HashMap::new();
        v.insert("first_name".to_string(), "Grace".to_string());
        v.insert("company".to_string(), "Navy".to_string());
        v
    }

    #[test]
    fn test_substitutes_with_whitespace() {
        let r = PlaceholderRenderer::new();
        let out = r.render_str("Hi {{first_name}}, how is {{ company }}?", &vars()).unwrap();
        assert_eq!(out, "Hi Grace, how is Navy?");
    }

    #[test]
    fn test_unknown_variable_lenient_vs_strict() {
        let out = PlaceholderRenderer::new().render_str("a{{missing}}b", &vars()).unwrap();
        assert_eq!(out, "ab");
        let err = PlaceholderRenderer::strict().render_str("a{{missing}}b", &vars()).unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_unterminated_placeholder_kept() {
        let out = PlaceholderRenderer::new().render_str("Hello {{first_name", &vars()).unwrap();
        assert_eq!(out, "Hello {{first_name");
    }

    #[test]
    fn test_render_step_against_lead() {
        let step = CampaignStep {
            id: Uuid::new_v4(),
            order: 1,
            delay_hours: 0,
            delay_minutes: 0,
            subject_template: "Quick question, {{first_name}}".to_string(),
            body_template: "<p>Hello from {{company}}</p>".to_string(),
        };
        let lead = Lead {
            id: Uuid::new_v4(),
            email: "lin@example.com".to_string(),
            first_name: Some("Lin".to_string()),
            company: Some("Acme".to_string()),
            ..Default::default()
        };
        let rendered = PlaceholderRenderer::new().render(&step, &lead).unwrap();
        assert_eq!(rendered.subject, "Quick question, Lin");
        assert_eq!(rendered.body_html, "<p>Hello from Acme</p>");
    }
}
