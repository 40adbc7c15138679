//! Text cleaners run before symbol lookup.
//!
//! - `basic_cleaners` — lowercase + whitespace collapse
//! - `english_cleaners` — ASCII transliteration, lowercase, number and
//!   abbreviation expansion, whitespace collapse

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::{Error, Result};

/// Apply the named cleaners in order.
pub fn clean_text(text: &str, cleaner_names: &[String]) -> Result<String> {
    let mut text = text.to_string();
    for name in cleaner_names {
        text = match name.as_str() {
            "basic_cleaners" => basic_cleaners(&text),
            "english_cleaners" => english_cleaners(&text),
            other => return Err(Error::Config(format!("unknown cleaner: {other}"))),
        };
    }
    Ok(text)
}

pub fn basic_cleaners(text: &str) -> String {
    collapse_whitespace(&text.to_lowercase())
}

pub fn english_cleaners(text: &str) -> String {
    let text = convert_to_ascii(text);
    let text = text.to_lowercase();
    let text = expand_numbers(&text);
    let text = expand_abbreviations(&text);
    collapse_whitespace(&text)
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Transliterate common Latin-1 letters; other non-ASCII characters are dropped.
fn convert_to_ascii(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if c.is_ascii() {
            out.push(c);
            continue;
        }
        let mapped = match c {
            'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' => "a",
            'À' | 'Á' | 'Â' | 'Ã' | 'Ä' | 'Å' => "A",
            'æ' => "ae",
            'Æ' => "AE",
            'ç' => "c",
            'Ç' => "C",
            'è' | 'é' | 'ê' | 'ë' => "e",
            'È' | 'É' | 'Ê' | 'Ë' => "E",
            'ì' | 'í' | 'î' | 'ï' => "i",
            'Ì' | 'Í' | 'Î' | 'Ï' => "I",
            'ñ' => "n",
            'Ñ' => "N",
            'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' => "o",
            'Ò' | 'Ó' | 'Ô' | 'Õ' | 'Ö' | 'Ø' => "O",
            'ù' | 'ú' | 'û' | 'ü' => "u",
            'Ù' | 'Ú' | 'Û' | 'Ü' => "U",
            'ý' | 'ÿ' => "y",
            'ß' => "ss",
            '‘' | '’' => "'",
            '“' | '”' => "\"",
            '–' | '—' => "-",
            _ => "",
        };
        out.push_str(mapped);
    }
    out
}

const ABBREVIATIONS: &[(&str, &str)] = &[
    ("mrs", "misess"),
    ("mr", "mister"),
    ("dr", "doctor"),
    ("st", "saint"),
    ("co", "company"),
    ("jr", "junior"),
    ("maj", "major"),
    ("gen", "general"),
    ("drs", "doctors"),
    ("rev", "reverend"),
    ("lt", "lieutenant"),
    ("hon", "honorable"),
    ("sgt", "sergeant"),
    ("capt", "captain"),
    ("esq", "esquire"),
    ("ltd", "limited"),
    ("col", "colonel"),
    ("ft", "fort"),
];

static ABBREVIATION_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    ABBREVIATIONS
        .iter()
        .map(|(abbr, full)| {
            let pattern = format!(r"(?i)\b{abbr}\.");
            (Regex::new(&pattern).expect("valid abbreviation pattern"), *full)
        })
        .collect()
});

static COMMA_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([0-9][0-9,]+[0-9])").expect("valid comma pattern"));

static DOLLARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$([0-9.,]*[0-9]+)").expect("valid dollar pattern"));

static DECIMAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([0-9]+)\.([0-9]+)").expect("valid decimal pattern"));

static ORDINAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([0-9]+)(?:st|nd|rd|th)").expect("valid ordinal pattern"));

static NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"[0-9]+").expect("valid number pattern"));

/// Expand `<abbr>.` at word boundaries.
fn expand_abbreviations(text: &str) -> String {
    let mut text = text.to_string();
    for (re, full) in ABBREVIATION_PATTERNS.iter() {
        text = re.replace_all(&text, *full).into_owned();
    }
    text
}

/// Expand digit runs: thousands separators, `$` amounts, decimals, ordinals,
/// years and plain integers, in that order.
fn expand_numbers(text: &str) -> String {
    let text = COMMA_NUMBER.replace_all(text, |caps: &Captures| caps[1].replace(',', ""));
    let text = DOLLARS.replace_all(&text, |caps: &Captures| dollars_to_words(&caps[1]));
    let text = DECIMAL.replace_all(&text, |caps: &Captures| {
        format!("{} point {}", integer_to_words(&caps[1]), spell_digits(&caps[2]))
    });
    let text = ORDINAL.replace_all(&text, |caps: &Captures| match caps[1].parse::<u64>() {
        Ok(n) => ordinal_to_words(n),
        Err(_) => spell_digits(&caps[1]),
    });
    let text = NUMBER.replace_all(&text, |caps: &Captures| match caps[0].parse::<u64>() {
        Ok(n) if n > 1000 && n < 3000 => year_to_words(n),
        _ => integer_to_words(&caps[0]),
    });
    text.into_owned()
}

/// `"12.50"` → `"twelve dollars, fifty cents"`. Amounts with more than one
/// decimal point are read as plain dollars.
fn dollars_to_words(amount: &str) -> String {
    let parts: Vec<&str> = amount.split('.').collect();
    if parts.len() > 2 {
        return format!("{amount} dollars");
    }
    let dollars = parts[0].parse::<u64>().unwrap_or(0);
    let cents = parts.get(1).and_then(|c| c.parse::<u64>().ok()).unwrap_or(0);
    let unit = |n: u64, one: &str, many: &str| {
        format!("{} {}", number_to_words(n), if n == 1 { one } else { many })
    };
    match (dollars, cents) {
        (0, 0) => "zero dollars".to_string(),
        (d, 0) => unit(d, "dollar", "dollars"),
        (0, c) => unit(c, "cent", "cents"),
        (d, c) => format!("{}, {}", unit(d, "dollar", "dollars"), unit(c, "cent", "cents")),
    }
}

/// Integer digits as words, or digit by digit when too long for `u64`.
fn integer_to_words(digits: &str) -> String {
    match digits.parse::<u64>() {
        Ok(n) => number_to_words(n),
        Err(_) => spell_digits(digits),
    }
}

fn spell_digits(digits: &str) -> String {
    digits
        .chars()
        .filter_map(|d| d.to_digit(10))
        .map(|d| ONES[d as usize])
        .collect::<Vec<_>>()
        .join(" ")
}

const ONES: [&str; 20] = [
    "zero",
    "one",
    "two",
    "three",
    "four",
    "five",
    "six",
    "seven",
    "eight",
    "nine",
    "ten",
    "eleven",
    "twelve",
    "thirteen",
    "fourteen",
    "fifteen",
    "sixteen",
    "seventeen",
    "eighteen",
    "nineteen",
];

const TENS: [&str; 10] = [
    "", "", "twenty", "thirty", "forty", "fifty", "sixty", "seventy", "eighty", "ninety",
];

const SCALES: [(u64, &str); 5] = [
    (1_000_000_000_000_000, "quadrillion"),
    (1_000_000_000_000, "trillion"),
    (1_000_000_000, "billion"),
    (1_000_000, "million"),
    (1_000, "thousand"),
];

fn below_hundred(n: u64) -> String {
    if n < 20 {
        ONES[n as usize].to_string()
    } else if n % 10 == 0 {
        TENS[(n / 10) as usize].to_string()
    } else {
        format!("{}-{}", TENS[(n / 10) as usize], ONES[(n % 10) as usize])
    }
}

fn below_thousand(n: u64) -> String {
    match (n / 100, n % 100) {
        (0, rest) => below_hundred(rest),
        (h, 0) => format!("{} hundred", ONES[h as usize]),
        (h, rest) => format!("{} hundred {}", ONES[h as usize], below_hundred(rest)),
    }
}

pub(crate) fn number_to_words(n: u64) -> String {
    if n == 0 {
        return "zero".to_string();
    }
    let mut parts = Vec::new();
    let mut rest = n;
    for (scale, name) in SCALES {
        if rest >= scale {
            parts.push(format!("{} {name}", number_to_words(rest / scale)));
            rest %= scale;
        }
    }
    if rest > 0 {
        parts.push(below_thousand(rest));
    }
    parts.join(" ")
}

fn year_to_words(n: u64) -> String {
    if n == 2000 {
        "two thousand".to_string()
    } else if n > 2000 && n < 2010 {
        format!("two thousand {}", ONES[(n % 100) as usize])
    } else if n % 100 == 0 {
        format!("{} hundred", below_hundred(n / 100))
    } else {
        let low = n % 100;
        let low = if low < 10 {
            format!("oh {}", ONES[low as usize])
        } else {
            below_hundred(low)
        };
        format!("{} {low}", below_hundred(n / 100))
    }
}

fn ordinal_to_words(n: u64) -> String {
    let words = number_to_words(n);
    let split = words.rfind(&[' ', '-'][..]).map(|i| i + 1).unwrap_or(0);
    let (head, last) = words.split_at(split);
    let last = match last {
        "one" => "first".to_string(),
        "two" => "second".to_string(),
        "three" => "third".to_string(),
        "five" => "fifth".to_string(),
        "eight" => "eighth".to_string(),
        "nine" => "ninth".to_string(),
        "twelve" => "twelfth".to_string(),
        w if w.ends_with('y') => format!("{}ieth", &w[..w.len() - 1]),
        w => format!("{w}th"),
    };
    format!("{head}{last}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_lowercases_and_collapses() {
        assert_eq!(basic_cleaners("  Hello\t  World \n"), "hello world");
    }

    #[test]
    fn numbers_to_words() {
        assert_eq!(number_to_words(0), "zero");
        assert_eq!(number_to_words(42), "forty-two");
        assert_eq!(number_to_words(115), "one hundred fifteen");
        assert_eq!(number_to_words(1_000_001), "one million one");
    }

    #[test]
    fn english_expands_numbers_in_context() {
        assert_eq!(english_cleaners("I have 3 cats."), "i have three cats.");
        assert_eq!(english_cleaners("It cost $5"), "it cost five dollars");
        assert_eq!(english_cleaners("pi is 3.14"), "pi is three point one four");
        assert_eq!(english_cleaners("10,000 people"), "ten thousand people");
    }

    #[test]
    fn dollar_amounts_read_dollars_and_cents() {
        assert_eq!(english_cleaners("$1"), "one dollar");
        assert_eq!(english_cleaners("$12.50 each"), "twelve dollars, fifty cents each");
        assert_eq!(english_cleaners("$0.01"), "one cent");
        assert_eq!(english_cleaners("$1,000,000"), "one million dollars");
    }

    #[test]
    fn oversized_numbers_are_spelled_digit_by_digit() {
        assert_eq!(
            english_cleaners("code 123456789012345678901"),
            "code one two three four five six seven eight nine zero one two three four five \
             six seven eight nine zero one"
        );
    }

    #[test]
    fn years_and_ordinals() {
        assert_eq!(english_cleaners("in 1984"), "in nineteen eighty-four");
        assert_eq!(english_cleaners("in 2005"), "in two thousand five");
        assert_eq!(english_cleaners("the 1900 census"), "the nineteen hundred census");
        assert_eq!(english_cleaners("the 21st time"), "the twenty-first time");
        assert_eq!(english_cleaners("my 12th try"), "my twelfth try");
    }

    #[test]
    fn abbreviations_expand_only_with_period() {
        assert_eq!(english_cleaners("Dr. Smith"), "doctor smith");
        assert_eq!(english_cleaners("the dr is in"), "the dr is in");
        assert_eq!(english_cleaners("Mrs. Jones"), "misess jones");
        assert_eq!(
            english_cleaners("Drs. Who and Lt. Col. Smith"),
            "doctors who and lieutenant colonel smith"
        );
        assert_eq!(english_cleaners("the bestdr. ever"), "the bestdr. ever");
        assert_eq!(english_cleaners("Main St., Ft. Worth"), "main saint, fort worth");
    }

    #[test]
    fn accents_transliterated() {
        assert_eq!(english_cleaners("Café Ñandú"), "cafe nandu");
    }

    #[test]
    fn unknown_cleaner_is_config_error() {
        let err = clean_text("x", &["klingon_cleaners".to_string()]).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
