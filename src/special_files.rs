//! The `(listfile)` pseudo-file: the only special file SPEC_FULL.md names explicitly.

/// Parse a `(listfile)` blob into the filenames it lists. One name per line;
/// `;` and `#` start a comment, optional `;metadata` after the name is stripped,
/// blank lines are ignored.
pub fn parse_listfile(data: &[u8]) -> Vec<String> {
    let content = match std::str::from_utf8(data) {
        Ok(s) => s.to_string(),
        Err(_) => {
            log::warn!("(listfile) contains invalid UTF-8, using lossy conversion");
            String::from_utf8_lossy(data).into_owned()
        }
    };

    content
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                return None;
            }

            let name = match line.find(';') {
                Some(pos) => line[..pos].trim(),
                None => line,
            };

            if name.is_empty() {
                None
            } else {
                Some(name.to_string())
            }
        })
        .collect()
}

/// Serialize a set of filenames back into `(listfile)` bytes, one per line,
/// `\r\n`-terminated the way StormLib-produced archives do.
pub fn build_listfile<'a>(names: impl Iterator<Item = &'a str>) -> Vec<u8> {
    let mut out = Vec::new();
    for name in names {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_names_and_skips_comments() {
        let data = b"; comment\r\nunits.dat\r\n# also a comment\r\n\r\nstrings.txt;1033\r\n";
        let names = parse_listfile(data);
        assert_eq!(names, vec!["units.dat", "strings.txt"]);
    }

    #[test]
    fn falls_back_to_lossy_on_bad_utf8() {
        let mut data = b"good.txt\r\n".to_vec();
        data.extend_from_slice(&[0xFF, 0xFE]);
        let names = parse_listfile(&data);
        assert_eq!(names[0], "good.txt");
    }

    #[test]
    fn build_then_parse_round_trips() {
        let names = vec!["a.txt", "dir\\b.txt"];
        let blob = build_listfile(names.iter().copied());
        assert_eq!(parse_listfile(&blob), names);
    }
}
