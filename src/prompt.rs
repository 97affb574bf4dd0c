//! Prompt template shared by the engine and the stream cleaner
//!
//! The generation service is instructed with an input template of the form
//! "Message: ... / Emotions: ..." and sometimes echoes a leading label from
//! the output template back at us. Formatting, parsing, and label stripping
//! all live here so both the streaming and non-streaming paths clean text
//! identically.

/// Leading labels the model is known to prepend, checked in order.
/// The pass is cumulative, so a doubled label like "response: output: hi"
/// strips down to "hi" in one call.
const BOILERPLATE_PREFIXES: &[&str] = &[
    "response:",
    "response template:",
    "output:",
    "output template:",
];

/// Strip known boilerplate labels from the start of `text`, case-insensitively.
/// Input without a matching prefix comes back unchanged, untrimmed.
pub fn strip_boilerplate(text: &str) -> String {
    let mut result = text;
    for prefix in BOILERPLATE_PREFIXES {
        if let Some(rest) = strip_prefix_ignore_case(result, prefix) {
            result = rest.trim();
        }
    }
    result.to_string()
}

fn strip_prefix_ignore_case<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        text.get(prefix.len()..)
    } else {
        None
    }
}

/// Format the emotion-augmented prompt sent to the model.
///
/// Labels are title-cased and kept in the classifier's native order.
/// Percentages are printed at full precision, so a formatted prompt parses
/// back to bitwise-identical values.
pub fn format_prompt(message: &str, distribution: &[(String, f64)]) -> String {
    use std::fmt::Write;

    let mut prompt = format!("Message: {message}\n\nEmotions:\n");
    for (label, pct) in distribution {
        let _ = writeln!(prompt, "{}: {pct}%", title_case(label));
    }
    prompt
}

/// Parse a prompt produced by [`format_prompt`] back into the message text
/// and the label/percentage pairs. Returns `None` for text that does not
/// follow the template.
pub fn parse_prompt(prompt: &str) -> Option<(String, Vec<(String, f64)>)> {
    let rest = prompt.strip_prefix("Message: ")?;
    let (message, emotions) = rest.split_once("\n\nEmotions:\n")?;

    let mut pairs = Vec::new();
    for line in emotions.lines() {
        if line.is_empty() {
            continue;
        }
        let (label, value) = line.split_once(": ")?;
        let pct: f64 = value.strip_suffix('%')?.parse().ok()?;
        pairs.push((label.to_lowercase(), pct));
    }
    Some((message.to_string(), pairs))
}

/// Uppercase the first character of each whitespace-separated word.
fn title_case(s: &str) -> String {
    s.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
