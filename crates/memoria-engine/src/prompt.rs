//! Completion prompts and output cleanup shared by the LLM-assisted paths.
//!
//! Every caller treats the completion as optional: a prompt that fails,
//! times out or produces unparseable output falls back to the deterministic
//! path.

/// Builds the HyDE rewrite prompt: ask for a short hypothetical memory that
/// would answer the query, and search with that instead of the raw query.
pub struct RewritePrompt;

impl RewritePrompt {
    /// `None` for a blank query.
    pub fn build(query: &str) -> Option<String> {
        let query = query.trim();
        if query.is_empty() {
            return None;
        }

        let mut prompt = String::with_capacity(REWRITE_INSTRUCTION.len() + query.len() + 64);
        prompt.push_str(REWRITE_INSTRUCTION);
        prompt.push_str("\n\nQuestion: ");
        prompt.push_str(query);
        prompt.push_str("\n\nRespond with ONLY the statement. No quotes, no preamble.\n");
        Some(prompt)
    }
}

const REWRITE_INSTRUCTION: &str = r#"You help a memory system find stored facts about a user. Given a question, write ONE short declarative statement (under 30 words) that a stored memory answering the question might contain.

Rules:
- Write the statement as if it were already known, e.g. "User prefers dark mode in the editor".
- Reuse the key words of the question.
- Do not hedge and do not explain."#;

/// Strip markdown code fences from LLM output.
pub fn strip_code_fences(s: &str) -> &str {
    let s = s.trim();

    if let Some(rest) = s.strip_prefix("```json")
        && let Some(inner) = rest.strip_suffix("```")
    {
        return inner.trim();
    }
    if let Some(rest) = s.strip_prefix("```")
        && let Some(inner) = rest.strip_suffix("```")
    {
        return inner.trim();
    }

    s
}

/// Find the outermost `{...}` in the text.
pub fn extract_json_object(s: &str) -> Option<&str> {
    let start = s.find('{')?;
    let end = s.rfind('}')?;
    (end > start).then(|| &s[start..=end])
}

/// Clean free-text LLM output: fences, a leading label and wrapping quotes.
///
/// Returns `None` when nothing usable is left.
pub fn clean_completion(raw: &str) -> Option<String> {
    let mut s = strip_code_fences(raw);

    for label in ["Statement:", "Summary:", "Answer:"] {
        if let Some(rest) = s.strip_prefix(label) {
            s = rest.trim();
        }
    }
    let s = s.trim_matches(|c| c == '"' || c == '\'' || c == '`').trim();

    (!s.is_empty()).then(|| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rewrite_prompt() {
        let prompt = RewritePrompt::build("what theme does the user like?").unwrap();
        assert!(prompt.contains("Question: what theme does the user like?"));
        assert!(RewritePrompt::build("   ").is_none());
    }

    #[test]
    fn test_strip_code_fences() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\nplain\n```"), "plain");
        assert_eq!(strip_code_fences("  bare  "), "bare");
    }

    #[test]
    fn test_extract_json_object() {
        assert_eq!(
            extract_json_object("Sure! {\"category\": \"rule\"} hope that helps"),
            Some("{\"category\": \"rule\"}")
        );
        assert_eq!(extract_json_object("no json here"), None);
    }

    #[test]
    fn test_clean_completion() {
        assert_eq!(
            clean_completion("Statement: \"User prefers dark mode\"").as_deref(),
            Some("User prefers dark mode")
        );
        assert_eq!(clean_completion("```\n```"), None);
        assert_eq!(clean_completion("   "), None);
    }
}
