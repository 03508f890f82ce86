//! Assembly of the next prompt body.
//!
//! Context injections, elided step output and cycle prologues accumulate
//! here until a sending prompt consumes them; HEADER/FOOTER decorations
//! wrap every sent prompt.

use crate::context::resolver::ResolvedFile;
use crate::workflow::PromptDecorations;

#[derive(Debug, Default)]
pub struct PromptBuffer {
    /// Labelled blocks prepended to the next prompt, in insertion order.
    prelude: Vec<String>,
    /// Output of elided steps, folded into the next prompt body.
    elided: Vec<String>,
}

impl PromptBuffer {
    pub fn push_prologue(&mut self, text: &str) {
        self.prelude.push(text.to_string());
    }

    /// Queue resolved context files as a labelled block.
    pub fn push_context(&mut self, files: &[ResolvedFile]) {
        for file in files {
            let label = match file.byte_range {
                Some((from, to)) => format!("{} [bytes {from}..{to}]", file.path.display()),
                None => file.path.display().to_string(),
            };
            self.prelude
                .push(format!("--- {label} ---\n{}", file.contents));
        }
    }

    /// Queue a captured command or verifier output block.
    pub fn push_output(&mut self, label: &str, output: &str) {
        self.prelude
            .push(format!("--- output of {label} ---\n{output}"));
    }

    /// Queue an elided step's contribution to the next assistant turn.
    pub fn push_elided(&mut self, text: String) {
        self.elided.push(text);
    }

    pub fn has_pending(&self) -> bool {
        !self.prelude.is_empty() || !self.elided.is_empty()
    }

    /// Drain everything pending into one prompt body around `text`.
    pub fn assemble(&mut self, text: &str, decorations: &PromptDecorations) -> String {
        let mut parts: Vec<String> = Vec::new();
        parts.append(&mut self.prelude);
        if let Some(header) = &decorations.header {
            parts.push(header.clone());
        }
        parts.append(&mut self.elided);
        parts.push(text.to_string());
        if let Some(footer) = &decorations.footer {
            parts.push(footer.clone());
        }
        parts.retain(|p| !p.is_empty());
        parts.join("\n\n")
    }

    /// Drop pending content, returning how many blocks were discarded.
    pub fn discard(&mut self) -> usize {
        let count = self.prelude.len() + self.elided.len();
        self.prelude.clear();
        self.elided.clear();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_assemble_order() {
        let mut buffer = PromptBuffer::default();
        buffer.push_context(&[ResolvedFile {
            path: PathBuf::from("src/a.rs"),
            contents: "fn a() {}".into(),
            byte_range: None,
        }]);
        buffer.push_elided("Analyze the test run.".into());
        buffer.push_elided("--- output of /bin/echo ok ---\nok".into());
        let decorations = PromptDecorations::default();
        let body = buffer.assemble("Summarize.", &decorations);

        let ctx = body.find("src/a.rs").unwrap();
        let analyze = body.find("Analyze the test run.").unwrap();
        let echoed = body.find("ok").unwrap();
        let summarize = body.find("Summarize.").unwrap();
        assert!(ctx < analyze && analyze < echoed && echoed < summarize);
        assert!(!buffer.has_pending());
    }

    #[test]
    fn test_header_footer_wrap() {
        let mut buffer = PromptBuffer::default();
        let decorations = PromptDecorations {
            header: Some("Context first.".into()),
            footer: Some("Keep replies short.".into()),
            ..PromptDecorations::default()
        };
        let body = buffer.assemble("Do the thing.", &decorations);
        assert!(body.starts_with("Context first."));
        assert!(body.ends_with("Keep replies short."));
    }

    #[test]
    fn test_discard_counts() {
        let mut buffer = PromptBuffer::default();
        buffer.push_prologue("p");
        buffer.push_elided("e".into());
        assert_eq!(buffer.discard(), 2);
        assert!(!buffer.has_pending());
    }
}
