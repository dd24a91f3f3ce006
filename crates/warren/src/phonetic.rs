use rphonetic::DoubleMetaphone;

/// Phonetic lookup rows store fixed-width four-character codes.
const CODE_LEN: usize = 4;

/// Double-metaphone codes for a name value: the primary code, plus the
/// alternate when it differs and the context asked for loose matching.
pub(crate) fn codes(value: &str, loose: bool) -> (String, Option<String>) {
    let encoder = DoubleMetaphone::default();
    let result = encoder.double_metaphone(value);

    let primary = pad(result.primary());
    let alternate = match result.alternate() {
        alt if loose && !alt.trim().is_empty() => {
            let alt = pad(alt);
            (alt != primary).then_some(alt)
        }
        _ => None,
    };

    (primary, alternate)
}

fn pad(code: String) -> String {
    let mut code = code;
    code.truncate(CODE_LEN);
    while code.len() < CODE_LEN {
        code.push(' ');
    }
    code
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn codes_are_padded_to_four() {
        let (primary, _) = codes("foo", false);
        assert_eq!(primary.len(), 4);
        let (primary, _) = codes("incomprehensibilities", false);
        assert_eq!(primary.len(), 4);
    }

    #[test]
    fn alternate_requires_loose() {
        // "window" yields distinct primary and alternate codes.
        let (_, strict) = codes("window", false);
        assert_eq!(strict, None);
        let (primary, loose) = codes("window", true);
        if let Some(alt) = loose {
            assert_eq!(alt.len(), 4);
            assert_ne!(alt, primary);
        }
    }
}
