use std::borrow::Cow;

use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

/// Display width of a string in terminal columns (CJK and emoji count as 2).
pub fn display_width(s: &str) -> usize {
    UnicodeWidthStr::width(s)
}

fn is_stripped_control(b: u8) -> bool {
    b == 0x7f || (b < 0x20 && b != b'\t' && b != b'\n' && b != b'\r')
}

/// Removes terminal control characters and ANSI escape sequences.
///
/// Feed titles are remote input printed straight to a terminal, so CSI
/// (`ESC [ ... final`), OSC (`ESC ] ... BEL|ESC \`), bare ESC, DEL and C0
/// controls other than tab, newline and carriage return are dropped.
///
/// Returns `Cow::Borrowed` when nothing needs stripping.
pub fn strip_control_chars(s: &str) -> Cow<'_, str> {
    let bytes = s.as_bytes();
    if !bytes.iter().any(|&b| b == 0x1b || is_stripped_control(b)) {
        return Cow::Borrowed(s);
    }

    let mut out = String::with_capacity(s.len());
    let mut i = 0;
    let mut run_start = 0;

    while i < bytes.len() {
        let b = bytes[i];
        if b != 0x1b && !is_stripped_control(b) {
            i += 1;
            continue;
        }

        // Control and escape bytes are ASCII, so this slice is on a char boundary.
        out.push_str(&s[run_start..i]);

        if b == 0x1b {
            match bytes.get(i + 1) {
                Some(b'[') => {
                    i += 2;
                    while i < bytes.len() {
                        let c = bytes[i];
                        i += 1;
                        if (0x40..=0x7e).contains(&c) {
                            break;
                        }
                    }
                }
                Some(b']') => {
                    i += 2;
                    while i < bytes.len() {
                        if bytes[i] == 0x07 {
                            i += 1;
                            break;
                        }
                        if bytes[i] == 0x1b && bytes.get(i + 1) == Some(&b'\\') {
                            i += 2;
                            break;
                        }
                        i += 1;
                    }
                }
                _ => i += 1,
            }
        } else {
            i += 1;
        }
        run_start = i;
    }
    out.push_str(&s[run_start..]);

    Cow::Owned(out)
}

/// Greedy word wrap to at most `width` columns per line.
///
/// Whitespace runs collapse to a single space. A word wider than `width` is
/// split across lines. Blank input yields no lines.
pub fn wrap_to_width(s: &str, width: usize) -> Vec<String> {
    let width = width.max(1);
    let mut lines = Vec::new();
    let mut line = String::new();
    let mut line_width = 0;

    for word in s.split_whitespace() {
        let word_width = display_width(word);

        if line_width > 0 && line_width + 1 + word_width <= width {
            line.push(' ');
            line.push_str(word);
            line_width += 1 + word_width;
            continue;
        }

        if line_width > 0 {
            lines.push(std::mem::take(&mut line));
            line_width = 0;
        }

        if word_width <= width {
            line.push_str(word);
            line_width = word_width;
            continue;
        }

        for c in word.chars() {
            let char_width = UnicodeWidthChar::width(c).unwrap_or(0);
            if line_width + char_width > width && line_width > 0 {
                lines.push(std::mem::take(&mut line));
                line_width = 0;
            }
            line.push(c);
            line_width += char_width;
        }
    }

    if !line.is_empty() {
        lines.push(line);
    }
    lines
}
