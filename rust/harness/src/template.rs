//! `{placeholder}` expansion for configured command lines.

use sweep_config::TrialSpec;

/// Named values substituted into command templates.
///
/// Unknown placeholders are left as written.
#[derive(Debug, Clone, Default)]
pub struct TemplateVars {
    vars: Vec<(&'static str, String)>,
}

impl TemplateVars {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `{model}`, `{parallelism}`, `{batch}`, `{input_len}`, `{output_len}`, `{trial_id}`.
    #[must_use]
    pub fn for_trial(spec: &TrialSpec) -> Self {
        Self::new()
            .with("model", &spec.model_id)
            .with("parallelism", spec.parallelism.to_string())
            .with("batch", spec.batch_size.to_string())
            .with("input_len", spec.input_length.to_string())
            .with("output_len", spec.output_length.to_string())
            .with("trial_id", spec.id())
    }

    /// Add or replace a value.
    #[must_use]
    pub fn with(mut self, key: &'static str, value: impl Into<String>) -> Self {
        let value = value.into();
        if let Some(slot) = self.vars.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            self.vars.push((key, value));
        }
        self
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    #[must_use]
    pub fn render(&self, template: &str) -> String {
        let mut out = template.to_string();
        for (key, value) in &self.vars {
            out = out.replace(&format!("{{{key}}}"), value);
        }
        out
    }

    #[must_use]
    pub fn render_all(&self, args: &[String]) -> Vec<String> {
        args.iter().map(|a| self.render(a)).collect()
    }
}
