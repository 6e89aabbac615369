use once_cell::sync::Lazy;
use regex::Regex;

static SPECIAL_TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<\|[^|<>]{1,64}\|>|</?s>|<pad>|<unk>").expect("special token"));
static SPACE_RUN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t]{2,}").expect("space run"));

/// Strips chat/special-token debris and code fences from a generated translation.
pub fn cleanup_model_text(text: &str) -> String {
    let mut s = text.trim().to_string();
    if s.starts_with("```") {
        if let Some(i) = s.find('\n') {
            s = s[i + 1..].to_string();
        }
        if let Some(end) = s.rfind("```") {
            s = s[..end].to_string();
        }
    }
    let s = SPECIAL_TOKEN_RE.replace_all(&s, " ");
    let s = SPACE_RUN_RE.replace_all(&s, " ");
    s.trim().to_string()
}

/// Single-line preview for log messages.
pub fn preview(text: &str, max_chars: usize) -> String {
    let flat: String = text
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let mut out: String = flat.chars().take(max_chars).collect();
    out.push('…');
    out
}
