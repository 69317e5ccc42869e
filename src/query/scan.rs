//! Scanner for `@source.table` references embedded in job SQL.
//!
//! A reference names a table of an external data source. The source part
//! carries an `@` marker; either identifier, or the whole reference, may be
//! double-quoted:
//!
//! ```text
//! @sales.orders   "@sales"."orders"   "@sales".orders   @sales."orders"   "@sales.orders"
//! ```
//!
//! Identifiers are `[A-Za-z0-9_]+`. A quote that opens must close around its
//! identifier, otherwise the candidate is not a reference and scanning
//! resumes after the `@`.

/// A data-source reference found in query text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    /// Exact substring matched, including any quoting.
    pub literal: String,
    /// Source name, without the `@` marker or quotes.
    pub source: String,
    /// Table name, without quotes.
    pub table: String,
}

/// Finds every data-source reference in `sql`, in text order. A reference
/// appearing twice yields two entries.
pub fn scan_references(sql: &str) -> Vec<Reference> {
    let bytes = sql.as_bytes();
    let mut refs = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let start = if bytes[i] == b'@' {
            i
        } else if bytes[i] == b'"' && bytes.get(i + 1) == Some(&b'@') {
            i
        } else {
            i += 1;
            continue;
        };
        let at = if bytes[start] == b'"' { start + 1 } else { start };
        match match_reference(sql, start) {
            Some((end, reference)) => {
                refs.push(reference);
                i = end;
            }
            None => i = at + 1,
        }
    }
    refs
}

/// Parses a job's write target, which must be exactly one reference with
/// nothing but surrounding whitespace around it.
pub fn parse_target(target: &str) -> Option<Reference> {
    let trimmed = target.trim();
    let (end, reference) = match_reference(trimmed, 0)?;
    if end == trimmed.len() {
        Some(reference)
    } else {
        None
    }
}

/// Tries to match one reference starting at `start`, which must point at the
/// `@` marker or at a `"` immediately preceding it. Returns the exclusive end
/// offset of the match.
fn match_reference(sql: &str, start: usize) -> Option<(usize, Reference)> {
    let bytes = sql.as_bytes();
    let mut i = start;
    let leading_quote = *bytes.get(i)? == b'"';
    if leading_quote {
        i += 1;
    }
    if bytes.get(i) != Some(&b'@') {
        return None;
    }
    i += 1;

    let source_start = i;
    let source_end = ident_end(bytes, source_start);
    if source_end == source_start {
        return None;
    }
    let source = &sql[source_start..source_end];
    i = source_end;

    let (end, table) = if leading_quote {
        match bytes.get(i) {
            // "@src"."tbl" or "@src".tbl
            Some(b'"') => {
                i += 1;
                if bytes.get(i) != Some(&b'.') {
                    return None;
                }
                quoted_or_bare_ident(sql, i + 1)?
            }
            // "@src.tbl": the closing quote follows the table name
            Some(b'.') => {
                let table_start = i + 1;
                let table_end = ident_end(bytes, table_start);
                if table_end == table_start || bytes.get(table_end) != Some(&b'"') {
                    return None;
                }
                (table_end + 1, &sql[table_start..table_end])
            }
            _ => return None,
        }
    } else {
        if bytes.get(i) != Some(&b'.') {
            return None;
        }
        quoted_or_bare_ident(sql, i + 1)?
    };

    Some((
        end,
        Reference {
            literal: sql[start..end].to_string(),
            source: source.to_string(),
            table: table.to_string(),
        },
    ))
}

/// Parses `ident` or `"ident"` at `i`; returns the exclusive end offset and
/// the identifier without quotes.
fn quoted_or_bare_ident(sql: &str, i: usize) -> Option<(usize, &str)> {
    let bytes = sql.as_bytes();
    if bytes.get(i) == Some(&b'"') {
        let start = i + 1;
        let end = ident_end(bytes, start);
        if end == start || bytes.get(end) != Some(&b'"') {
            return None;
        }
        Some((end + 1, &sql[start..end]))
    } else {
        let end = ident_end(bytes, i);
        if end == i {
            return None;
        }
        Some((end, &sql[i..end]))
    }
}

fn ident_end(bytes: &[u8], mut i: usize) -> usize {
    while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
        i += 1;
    }
    i
}
