//! OCR confusion correction
//!
//! Laser-etched markings make engines swap look-alike glyphs (0/O, 1/I,
//! 5/S, 8/B, 2/Z, 6/G). Corrections only fire when the surrounding
//! characters make the intended class clear.

use super::families::PART_FAMILIES;

/// Characters that look like digits
const DIGIT_LOOKALIKES: &[(char, char)] = &[
    ('O', '0'),
    ('D', '0'),
    ('Q', '0'),
    ('I', '1'),
    ('L', '1'),
    ('Z', '2'),
    ('S', '5'),
    ('G', '6'),
    ('T', '7'),
    ('B', '8'),
];

/// Digits that look like letters
const LETTER_LOOKALIKES: &[(char, char)] = &[
    ('0', 'O'),
    ('1', 'I'),
    ('2', 'Z'),
    ('5', 'S'),
    ('6', 'G'),
    ('8', 'B'),
];

/// Digit a letter is probably meant to be
pub fn to_digit(c: char) -> Option<char> {
    if c.is_ascii_digit() {
        return Some(c);
    }
    DIGIT_LOOKALIKES.iter().find(|(l, _)| *l == c).map(|(_, d)| *d)
}

/// Letter a digit is probably meant to be
pub fn to_letter(c: char) -> Option<char> {
    if c.is_ascii_uppercase() {
        return Some(c);
    }
    LETTER_LOOKALIKES.iter().find(|(d, _)| *d == c).map(|(_, l)| *l)
}

/// Whether an engine could plausibly have read `expected` as `seen`
fn confusable(seen: char, expected: char) -> bool {
    seen == expected
        || DIGIT_LOOKALIKES
            .iter()
            .any(|&(l, d)| (seen == l && expected == d) || (seen == d && expected == l))
}

/// Uppercase, unify punctuation, drop stray symbols and collapse whitespace
pub fn normalize_line(text: &str) -> String {
    let mapped: String = text
        .chars()
        .map(|c| match c {
            '|' => 'I',
            '—' | '–' | '_' => '-',
            '\t' => ' ',
            other => other,
        })
        .flat_map(char::to_uppercase)
        .filter(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || matches!(c, '-' | '/' | '.' | ' '))
        .collect();

    mapped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Replace a misread family prefix (`1M358` -> `LM358`, `0PA2134` -> `OPA2134`)
fn fix_family_prefix(chars: &mut [char]) -> usize {
    let mut families: Vec<&str> = PART_FAMILIES.iter().map(|(p, _)| *p).collect();
    families.sort_by_key(|p| std::cmp::Reverse(p.len()));

    for prefix in families {
        let expected: Vec<char> = prefix.chars().collect();
        if chars.len() < expected.len() + 1 {
            continue;
        }
        let head = &chars[..expected.len()];
        if !head.iter().zip(&expected).all(|(s, e)| confusable(*s, *e)) {
            continue;
        }
        let exact = head.iter().zip(&expected).filter(|(s, e)| s == e).count();
        if exact * 2 < expected.len() {
            continue;
        }
        if !chars[expected.len()..].iter().any(|c| c.is_ascii_digit()) {
            continue;
        }
        chars[..expected.len()].copy_from_slice(&expected);
        return expected.len();
    }
    0
}

/// Length of the run of characters satisfying `pred` ending just before `idx`
fn run_before(chars: &[char], idx: usize, pred: fn(&char) -> bool) -> usize {
    chars[..idx].iter().rev().take_while(|c| pred(c)).count()
}

/// Length of the run of characters satisfying `pred` starting just after `idx`
fn run_after(chars: &[char], idx: usize, pred: fn(&char) -> bool) -> usize {
    chars[idx + 1..].iter().take_while(|c| pred(c)).count()
}

/// Correct one whitespace-free token
pub fn correct_token(token: &str) -> String {
    let mut chars: Vec<char> = token.chars().collect();
    if chars.is_empty() {
        return String::new();
    }

    let start = fix_family_prefix(&mut chars);

    // Mostly-numeric tokens (date and lot codes) become fully numeric
    if start == 0 {
        let digits = chars.iter().filter(|c| c.is_ascii_digit()).count();
        let convertible = chars.iter().all(|c| to_digit(*c).is_some());
        if convertible && digits * 2 > chars.len() {
            return chars.iter().filter_map(|c| to_digit(*c)).collect();
        }
    }

    let is_digit: fn(&char) -> bool = |c| c.is_ascii_digit();
    let is_letter: fn(&char) -> bool = |c| c.is_ascii_uppercase();

    for i in start..chars.len() {
        let c = chars[i];
        if c.is_ascii_uppercase() {
            let left = run_before(&chars, i, is_digit);
            let right = run_after(&chars, i, is_digit);
            if left > 0 && right > 0 && left + right >= 3 {
                if let Some(d) = to_digit(c) {
                    chars[i] = d;
                }
            }
        } else if c.is_ascii_digit() {
            let left = run_before(&chars, i, is_letter);
            let right = run_after(&chars, i, is_letter);
            let inside = left >= 2 && right >= 2;
            let leading = i == 0 && right >= 2;
            if inside || leading {
                if let Some(l) = to_letter(c) {
                    chars[i] = l;
                }
            }
        }
    }

    chars.into_iter().collect()
}

/// Normalize a line and correct every token in it
pub fn correct_line(text: &str) -> String {
    normalize_line(text)
        .split(' ')
        .map(correct_token)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Coerce a date code candidate to digits, keeping one trailing letter
///
/// Returns `None` when the token cannot be a 4-digit code.
pub fn correct_date_code(token: &str) -> Option<String> {
    let chars: Vec<char> = normalize_line(token).chars().filter(|c| *c != ' ').collect();
    let (body, suffix) = match chars.len() {
        4 => (&chars[..], None),
        5 if chars[4].is_ascii_uppercase() && to_digit(chars[4]).is_none() => {
            (&chars[..4], Some(chars[4]))
        }
        _ => return None,
    };

    let digits: Option<String> = body.iter().map(|c| to_digit(*c)).collect();
    let mut code = digits?;
    if let Some(s) = suffix {
        code.push(s);
    }
    Some(code)
}
