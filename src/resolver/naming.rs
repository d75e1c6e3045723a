//! Filename derivation: pattern expansion, sanitization and slugging (spec
//! §4.3, §9 "duplicate implementations of filename sanitization... this spec
//! treats sanitization as a single pure function").

/// Tokens available to a naming pattern, taken verbatim from §4.3.
#[derive(Debug, Clone, Default)]
pub struct Tokens {
    pub model_name: Option<String>,
    pub version_name: Option<String>,
    pub version_id: Option<String>,
    pub file_name: Option<String>,
    pub file_type: Option<String>,
}

impl Tokens {
    fn lookup(&self, token: &str) -> &str {
        match token {
            "model_name" => self.model_name.as_deref(),
            "version_name" => self.version_name.as_deref(),
            "version_id" => self.version_id.as_deref(),
            "file_name" => self.file_name.as_deref(),
            "file_type" => self.file_type.as_deref(),
            _ => None,
        }
        .unwrap_or("")
    }
}

/// Expand `{token}` placeholders in `pattern` using `tokens`. Unknown
/// placeholders expand to the empty string rather than erroring — a missing
/// token should degrade gracefully, not abort the download.
pub fn pattern_expand(pattern: &str, tokens: &Tokens) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut chars = pattern.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '{' {
            out.push(c);
            continue;
        }
        let mut token = String::new();
        let mut closed = false;
        for c in chars.by_ref() {
            if c == '}' {
                closed = true;
                break;
            }
            token.push(c);
        }
        if closed {
            out.push_str(tokens.lookup(&token));
        } else {
            out.push('{');
            out.push_str(&token);
        }
    }

    out
}

/// Fallback heuristic used when no naming pattern is configured.
pub fn default_pattern_expand(tokens: &Tokens) -> String {
    pattern_expand("{model_name} - {file_name}", tokens)
}

/// Replace path separators and strip control/reserved characters. Applied to
/// every derived filename regardless of source.
pub fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' => '_',
            c if c.is_control() => '_',
            '<' | '>' | ':' | '"' | '|' | '?' | '*' => '_',
            c => c,
        })
        .collect::<String>()
        .trim()
        .to_string()
}

/// Reduce a sanitized name to a hyphen-slug while preserving its extension.
/// Applied on top of [`sanitize`] for registry-sourced filenames only (§4.3).
pub fn slugify(name: &str) -> String {
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    };

    let mut slug = String::with_capacity(stem.len());
    let mut last_was_sep = false;
    for c in stem.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            slug.push(c.to_ascii_lowercase());
            last_was_sep = false;
        } else if (c.is_whitespace() || c == '-') && !last_was_sep && !slug.is_empty() {
            slug.push('-');
            last_was_sep = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }

    match ext {
        Some(ext) => format!("{slug}.{}", ext.to_ascii_lowercase()),
        None => slug,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens() -> Tokens {
        Tokens {
            model_name: Some("DreamSDXL".to_string()),
            version_name: Some("v1".to_string()),
            version_id: Some("123".to_string()),
            file_name: Some("vae_fp16.safetensors".to_string()),
            file_type: Some("Model".to_string()),
        }
    }

    #[test]
    fn pattern_expand_substitutes_known_tokens() {
        let out = pattern_expand("{model_name} - {file_name}", &tokens());
        assert_eq!(out, "DreamSDXL - vae_fp16.safetensors");
    }

    #[test]
    fn pattern_expand_leaves_unclosed_brace_literal() {
        let out = pattern_expand("{model_name", &tokens());
        assert_eq!(out, "{model_name");
    }

    #[test]
    fn pattern_expand_unknown_token_is_empty() {
        let out = pattern_expand("{nonsense}", &tokens());
        assert_eq!(out, "");
    }

    #[test]
    fn sanitize_replaces_separators_and_reserved_chars() {
        assert_eq!(sanitize("a/b\\c:d*e"), "a_b_c_d_e");
    }

    #[test]
    fn slugify_preserves_extension_underscores_and_lowercases() {
        let out = slugify(&sanitize("DreamSDXL - vae_fp16.safetensors"));
        assert_eq!(out, "dreamsdxl-vae_fp16.safetensors");
    }

    #[test]
    fn slugify_without_extension_has_no_dot() {
        assert_eq!(slugify("Hello World"), "hello-world");
    }

    #[test]
    fn default_pattern_matches_fallback_heuristic() {
        assert_eq!(default_pattern_expand(&tokens()), "DreamSDXL - vae_fp16.safetensors");
    }
}
