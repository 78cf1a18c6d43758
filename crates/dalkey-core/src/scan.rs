//! Literal request scanner.
//!
//! Finds `require("...")`, `import ... from "..."`, `export ... from
//! "..."`, and `import("...")` request strings in source code without a
//! full parse. Presets use it for modules the packager did not pre-scan;
//! comments and non-literal arguments are skipped.

/// Scan source code for request strings, deduplicated in first-appearance
/// order.
#[must_use]
pub fn scan_requests(source: &str) -> Vec<String> {
    let mut results: Vec<String> = Vec::new();
    let chars: Vec<char> = source.chars().collect();
    let len = chars.len();
    let mut i = 0;

    let push = |request: String, results: &mut Vec<String>| {
        if !request.is_empty() && !results.contains(&request) {
            results.push(request);
        }
    };

    while i < len {
        // Line comments.
        if i + 1 < len && chars[i] == '/' && chars[i + 1] == '/' {
            while i < len && chars[i] != '\n' {
                i += 1;
            }
            continue;
        }
        // Block comments.
        if i + 1 < len && chars[i] == '/' && chars[i + 1] == '*' {
            i += 2;
            while i + 1 < len && !(chars[i] == '*' && chars[i + 1] == '/') {
                i += 1;
            }
            i += 2;
            continue;
        }

        if matches_keyword(&chars, i, "require") {
            if let Some((request, end)) = scan_call(&chars, i + 7) {
                push(request, &mut results);
                i = end;
                continue;
            }
        }

        if matches_keyword(&chars, i, "import") {
            // Dynamic import("...") or static import ... from "...".
            if let Some((request, end)) = scan_call(&chars, i + 6) {
                push(request, &mut results);
                i = end;
                continue;
            }
            if let Some((request, end)) = scan_from_clause(&chars, i + 6) {
                push(request, &mut results);
                i = end;
                continue;
            }
        }

        if matches_keyword(&chars, i, "export") {
            if let Some((request, end)) = scan_from_clause(&chars, i + 6) {
                push(request, &mut results);
                i = end;
                continue;
            }
        }

        i += 1;
    }

    results
}

/// Keyword match with word boundaries on both sides.
fn matches_keyword(chars: &[char], pos: usize, keyword: &str) -> bool {
    let len = keyword.len();
    if pos + len > chars.len() {
        return false;
    }
    if pos > 0 && is_ident_char(chars[pos - 1]) {
        return false;
    }
    if !chars[pos..pos + len].iter().copied().eq(keyword.chars()) {
        return false;
    }
    match chars.get(pos + len) {
        Some(&c) => !is_ident_char(c),
        None => true,
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

/// Scan `("literal")` after a keyword, tolerating whitespace.
fn scan_call(chars: &[char], mut i: usize) -> Option<(String, usize)> {
    i = skip_whitespace(chars, i);
    if chars.get(i) != Some(&'(') {
        return None;
    }
    i = skip_whitespace(chars, i + 1);
    let (literal, after) = scan_string_literal(chars, i)?;
    let close = skip_whitespace(chars, after);
    if chars.get(close) != Some(&')') {
        return None;
    }
    Some((literal, close + 1))
}

/// Scan an import/export clause up to `from "literal"`, or a bare
/// `import "literal"`.
fn scan_from_clause(chars: &[char], mut i: usize) -> Option<(String, usize)> {
    i = skip_whitespace(chars, i);

    // Side-effect import: import "./styles.css";
    if let Some(result) = scan_string_literal(chars, i) {
        return Some(result);
    }

    // Bounded scan for the `from` keyword on the same statement.
    let limit = chars.len().min(i + 512);
    let mut j = i;
    while j < limit {
        match chars[j] {
            ';' | ')' => return None,
            'f' if matches_keyword(chars, j, "from") => {
                let after = skip_whitespace(chars, j + 4);
                return scan_string_literal(chars, after);
            }
            _ => j += 1,
        }
    }
    None
}

fn scan_string_literal(chars: &[char], i: usize) -> Option<(String, usize)> {
    let quote = match chars.get(i) {
        Some(&c @ ('"' | '\'')) => c,
        _ => return None,
    };
    let mut j = i + 1;
    let mut literal = String::new();
    while j < chars.len() {
        let c = chars[j];
        if c == quote {
            return Some((literal, j + 1));
        }
        if c == '\n' {
            return None;
        }
        literal.push(c);
        j += 1;
    }
    None
}

fn skip_whitespace(chars: &[char], mut i: usize) -> usize {
    while i < chars.len() && chars[i].is_whitespace() {
        i += 1;
    }
    i
}
