use serde_yaml::{Mapping, Value};

/// Everything the parser can derive from raw note text.
/// Path, checksum and mtime are the caller's business.
#[derive(Debug, Clone, Default)]
pub struct ParsedNote {
    pub frontmatter: Mapping,
    pub body: String,
    pub title: String,
    pub tags: Vec<String>,
    pub links: Vec<String>,
}

/// Parse note content. Never fails: malformed YAML degrades to an empty
/// frontmatter with the entire original text as body.
pub fn parse(content: &str) -> ParsedNote {
    let (frontmatter, body) = split_frontmatter(content);

    let title = derive_title(&frontmatter, &body);
    let tags = extract_tags(&frontmatter, &body);
    let links = extract_wikilinks(&body);

    ParsedNote {
        frontmatter,
        body,
        title,
        tags,
        links,
    }
}

/// Split a leading YAML frontmatter block bounded by lines equal to `---`.
/// Returns (frontmatter, body). Without a block, or when the YAML is
/// malformed, the body is the full original content.
pub fn split_frontmatter(content: &str) -> (Mapping, String) {
    let stripped = content.trim_start_matches(['\r', '\n']);

    let first_line = stripped.lines().next().unwrap_or("");
    if first_line.trim_end_matches('\r') != "---" {
        return (Mapping::new(), content.to_string());
    }

    // Offset just past the opening delimiter line.
    let after_open = match stripped.find('\n') {
        Some(idx) => &stripped[idx + 1..],
        None => return (Mapping::new(), content.to_string()),
    };

    // Locate the closing delimiter line.
    let mut offset = 0;
    for line in after_open.split_inclusive('\n') {
        if line.trim_end_matches(['\r', '\n']) == "---" {
            let yaml = &after_open[..offset];
            let body = after_open[offset + line.len()..]
                .trim_start_matches(['\r', '\n'])
                .to_string();

            return match serde_yaml::from_str::<Value>(yaml) {
                Ok(value) => {
                    let map = value.as_mapping().cloned().unwrap_or_default();
                    (map, body)
                }
                Err(_) => (Mapping::new(), content.to_string()),
            };
        }
        offset += line.len();
    }

    // No closing delimiter: not a frontmatter block.
    (Mapping::new(), content.to_string())
}

/// Frontmatter `title` if present and non-empty, else the first H1 in the
/// body, else empty.
fn derive_title(frontmatter: &Mapping, body: &str) -> String {
    if let Some(title) = frontmatter
        .get(&Value::from("title"))
        .and_then(|v| v.as_str())
    {
        let title = title.trim();
        if !title.is_empty() {
            return title.to_string();
        }
    }

    for line in body.lines() {
        if let Some(rest) = line.trim_start().strip_prefix("# ") {
            let heading = rest.trim();
            if !heading.is_empty() {
                return heading.to_string();
            }
        }
    }

    String::new()
}

/// Extract wikilink targets from `[[target]]` and `[[target|alias]]`.
/// Duplicates are coalesced keeping first occurrence order.
pub fn extract_wikilinks(body: &str) -> Vec<String> {
    let mut links: Vec<String> = Vec::new();
    let mut rest = body;

    while let Some(open) = rest.find("[[") {
        let inner_start = open + 2;
        let Some(close) = rest[inner_start..].find("]]") else {
            break;
        };
        let inner = &rest[inner_start..inner_start + close];

        // The alias after `|` is display-only.
        let target = inner.split('|').next().unwrap_or(inner).trim();
        if !target.is_empty() && !links.iter().any(|l| l == target) {
            links.push(target.to_string());
        }

        rest = &rest[inner_start + close + 2..];
    }

    links
}

/// Union of frontmatter `tags` list items and inline `#tag` tokens,
/// deduplicated first-seen, frontmatter tags first.
pub fn extract_tags(frontmatter: &Mapping, body: &str) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();

    if let Some(seq) = frontmatter
        .get(&Value::from("tags"))
        .and_then(|v| v.as_sequence())
    {
        for item in seq {
            if let Some(tag) = item.as_str() {
                let tag = tag.trim();
                if !tag.is_empty() && !tags.iter().any(|t| t == tag) {
                    tags.push(tag.to_string());
                }
            }
        }
    }

    for tag in inline_tags(body) {
        if !tags.iter().any(|t| *t == tag) {
            tags.push(tag);
        }
    }

    tags
}

/// Inline tags: `#token` at start of text or after whitespace, where the
/// token starts with a letter and continues with `[A-Za-z0-9_/-]`.
fn inline_tags(body: &str) -> Vec<String> {
    let mut tags = Vec::new();
    let chars: Vec<char> = body.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        if chars[i] == '#' && (i == 0 || chars[i - 1].is_whitespace()) {
            let start = i + 1;
            let mut end = start;
            if end < chars.len() && chars[end].is_ascii_alphabetic() {
                end += 1;
                while end < chars.len()
                    && (chars[end].is_ascii_alphanumeric()
                        || matches!(chars[end], '_' | '/' | '-'))
                {
                    end += 1;
                }
                tags.push(chars[start..end].iter().collect());
                i = end;
                continue;
            }
        }
        i += 1;
    }

    tags
}
