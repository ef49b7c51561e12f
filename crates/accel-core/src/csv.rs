//! The bulk-load CSV dialect: comma separated, double-quote enclosed,
//! backslash escaped, `\N` for NULL, LF terminated, binary-safe payload.
//! Quoting is applied only to fields that contain the separator, the quote,
//! a newline, or leading/trailing whitespace; the first line of every shard
//! is the comma-joined column-name header.

use std::io::{self, Write};

/// Literal written for SQL NULL.
pub const NULL_FIELD: &[u8] = b"\\N";

/// Writes the header line.
///
/// # Errors
/// Returns any I/O error from the underlying writer.
pub fn write_header<W: Write>(out: &mut W, columns: &[String]) -> io::Result<()> {
    out.write_all(columns.join(",").as_bytes())?;
    out.write_all(b"\n")
}

/// Writes one data row. `None` fields are NULL.
///
/// # Errors
/// Returns any I/O error from the underlying writer.
pub fn write_row<W: Write>(out: &mut W, fields: &[Option<Vec<u8>>]) -> io::Result<()> {
    for (idx, field) in fields.iter().enumerate() {
        if idx > 0 {
            out.write_all(b",")?;
        }
        match field {
            None => out.write_all(NULL_FIELD)?,
            Some(bytes) => write_field(out, bytes)?,
        }
    }
    out.write_all(b"\n")
}

fn needs_quoting(field: &[u8]) -> bool {
    if field.is_empty() {
        return false;
    }
    let edge_whitespace = |b: u8| b == b' ' || b == b'\t';
    field
        .iter()
        .any(|&b| matches!(b, b',' | b'"' | b'\n' | b'\r'))
        || edge_whitespace(field[0])
        || edge_whitespace(field[field.len() - 1])
}

fn write_field<W: Write>(out: &mut W, field: &[u8]) -> io::Result<()> {
    if needs_quoting(field) {
        out.write_all(b"\"")?;
        write_escaped(out, field, true)?;
        out.write_all(b"\"")
    } else {
        write_escaped(out, field, false)
    }
}

/// Backslash escapes are applied in quoted and unquoted fields alike, so a
/// literal `\N` in the data never collides with the NULL marker.
fn write_escaped<W: Write>(out: &mut W, field: &[u8], quoted: bool) -> io::Result<()> {
    let mut start = 0;
    for (idx, &byte) in field.iter().enumerate() {
        if byte == b'\\' || (quoted && byte == b'"') {
            out.write_all(&field[start..idx])?;
            out.write_all(&[b'\\', byte])?;
            start = idx + 1;
        }
    }
    out.write_all(&field[start..])
}
