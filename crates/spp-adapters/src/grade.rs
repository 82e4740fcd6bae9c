//! Grade tokens: plain integers or Roman numerals as typed into survey forms.

const ROMAN_GRADES: [(&str, u32); 12] = [
    ("I", 1),
    ("II", 2),
    ("III", 3),
    ("IV", 4),
    ("V", 5),
    ("VI", 6),
    ("VII", 7),
    ("VIII", 8),
    ("IX", 9),
    ("X", 10),
    ("XI", 11),
    ("XII", 12),
];

const PREFIXES: [&str; 4] = ["KELAS", "KLS", "CLASS", "GRADE"];

/// Reads a grade from a whole token: an optional `Kelas`/`Class`/`Grade`
/// prefix, the grade itself, then at most one single-letter section (`VIII-B`).
/// A stray `||` is read as `II` (`V||` is grade 7). Anything else, including a
/// token with two grade-like words, returns 0; never fails.
pub fn grade_from_token(token: &str) -> u32 {
    let repaired = token.trim().to_uppercase().replace("||", "II");
    let mut words = repaired
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|word| !word.is_empty())
        .peekable();
    if words.peek().is_some_and(|word| PREFIXES.contains(word)) {
        words.next();
    }
    let Some(grade) = words.next().and_then(grade_word) else {
        return 0;
    };
    match (words.next(), words.next()) {
        (None, _) => grade,
        (Some(section), None) if is_section(section) => grade,
        _ => 0,
    }
}

fn is_section(word: &str) -> bool {
    word.len() == 1 && word.chars().all(|c| c.is_ascii_alphabetic()) && grade_word(word).is_none()
}

fn grade_word(word: &str) -> Option<u32> {
    if let Ok(n) = word.parse::<u32>() {
        return (1..=12).contains(&n).then_some(n);
    }
    ROMAN_GRADES
        .iter()
        .find(|(numeral, _)| *numeral == word)
        .map(|(_, value)| *value)
}
