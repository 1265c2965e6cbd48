//! Cheap output-language guard.
//!
//! Only the Turkish/English pair gets an opinion; everything else is treated
//! as matching so the guard never blocks languages it cannot judge.

const TURKISH_CHARS: [char; 12] = ['ç', 'ğ', 'ı', 'ö', 'ş', 'ü', 'Ç', 'Ğ', 'İ', 'Ö', 'Ş', 'Ü'];

const COMMON_ENGLISH: [&str; 12] = [
    "the", "and", "for", "with", "your", "this", "from", "that", "are", "is", "of", "to",
];

const COMMON_TURKISH: [&str; 12] = [
    "ve", "ile", "için", "bir", "bu", "daha", "olarak", "gibi", "en", "çok", "her", "da",
];

fn has_turkish_chars(text: &str) -> bool {
    text.chars().any(|c| TURKISH_CHARS.contains(&c))
}

fn count_tokens(text: &str, vocabulary: &[&str]) -> usize {
    text.split(|c: char| !c.is_alphabetic())
        .filter(|t| !t.is_empty())
        .filter(|t| {
            let lower = t.to_lowercase();
            vocabulary.contains(&lower.as_str())
        })
        .count()
}

/// Heuristic mismatch check between the requested language and the generated
/// texts.
pub fn is_language_mismatch(lang: &str, texts: &[&str]) -> bool {
    let combined = texts.join(" ");
    match lang {
        "tr" => {
            !has_turkish_chars(&combined)
                && count_tokens(&combined, &COMMON_ENGLISH) >= 3
                && count_tokens(&combined, &COMMON_TURKISH) == 0
        }
        "en" => has_turkish_chars(&combined),
        _ => false,
    }
}
