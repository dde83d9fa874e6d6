//! Author name normalization and comparison.
//!
//! Names arrive as free text such as `"Ellis, John R. (Ed.)"`. This module
//! turns them into:
//! - a *matchable name* used as an exact-equality lookup key,
//! - structured parts (surname, initials, first names),
//! - a last-name cluster key used to group score caches,
//! - a canonical display id such as `J.R.Ellis.1`.
//!
//! [`compare_names`] scores two raw names in `[0, 1]`; the reconciliation
//! engine uses it to detect renamed author fields.

use std::collections::HashSet;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

const IGNORED_TOKENS: [&str; 3] = ["et al.", "Et al.", "et al"];

const SURNAME_SEPARATORS: [char; 2] = [',', ';'];

const NAME_SEPARATORS: [char; 7] = [',', ';', '.', '=', '-', '(', ')'];

fn parentheses() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\([^)]*\)").expect("static regex is valid"))
}

fn remove_parenthesized(s: &str) -> String {
    parentheses().replace_all(s, "").into_owned()
}

fn apply_special_mapping(s: &str) -> String {
    s.replace(['-', '.'], " ").replace('\'', "")
}

fn apply_locale_mapping(s: &str) -> String {
    s.replace('ß', "ss")
        .replace('ä', "ae")
        .replace('ö', "oe")
        .replace('ü', "ue")
}

/// Strips diacritics by canonical decomposition.
fn fold_diacritics(s: &str) -> String {
    s.nfd().filter(|c| !is_combining_mark(*c)).collect()
}

/// Keeps letters, underscores and whitespace; drops punctuation and digits.
fn strip_special_and_digits(s: &str) -> String {
    s.chars()
        .filter(|c| (c.is_alphanumeric() && !c.is_numeric()) || *c == '_' || c.is_whitespace())
        .collect()
}

/// Cleans a name fragment for comparison without changing case or spacing.
#[must_use]
pub fn clean_string(s: &str) -> String {
    let s = remove_parenthesized(s);
    let s = apply_locale_mapping(&s);
    let s = apply_special_mapping(&s);
    let s = fold_diacritics(&s);
    strip_special_and_digits(&s)
}

fn is_unseparated_initials(token: &str) -> bool {
    token.chars().count() == 2 && token.chars().all(|c| c.is_alphabetic() && c.is_uppercase())
}

/// Builds the matchable form of a name: first names before the surname,
/// ASCII-folded, punctuation-free, single-spaced and lowercase.
///
/// ```
/// use authorid::names::create_matchable_name;
///
/// assert_eq!(create_matchable_name("Surname, Name (removed)"), "name surname");
/// assert_eq!(create_matchable_name("Smith, JR"), "j r smith");
/// ```
#[must_use]
pub fn create_matchable_name(name: &str) -> String {
    let mut name = remove_parenthesized(name);
    for token in IGNORED_TOKENS {
        name = name.replace(token, "");
    }

    let (last_name, first_name) = match name.split_once(',') {
        Some((last, first)) => (last.trim(), first.trim()),
        None => (name.trim(), ""),
    };

    let mut parts: Vec<String> = first_name
        .split_whitespace()
        .map(|part| {
            if is_unseparated_initials(part) {
                part.chars().map(String::from).collect::<Vec<_>>().join(" ")
            } else {
                part.to_string()
            }
        })
        .collect();
    parts.push(last_name.to_string());

    let full = parts.join(" ");
    let full = apply_special_mapping(&full);
    let full = apply_locale_mapping(&full);
    let full = fold_diacritics(&full);
    let full = strip_special_and_digits(&full);

    full.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// A name split into its structural parts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NameParts {
    /// Surname as written.
    pub surname: String,
    /// One initial per given-name token, in order.
    pub initials: Vec<String>,
    /// Given names that were written out in full.
    pub names: Vec<String>,
    /// For each entry of `names`, its index in `initials`.
    pub positions: Vec<usize>,
}

impl NameParts {
    /// Returns a copy with every part lowercased.
    #[must_use]
    pub fn to_lowercase(&self) -> Self {
        Self {
            surname: self.surname.to_lowercase(),
            initials: self.initials.iter().map(|i| i.to_lowercase()).collect(),
            names: self.names.iter().map(|n| n.to_lowercase()).collect(),
            positions: self.positions.clone(),
        }
    }
}

/// Splits `"Ellis, John R."` into surname `Ellis`, initials `[J, R]` and
/// names `[John]`. Without a separator the last word is the surname.
#[must_use]
pub fn split_name_parts(name: &str) -> NameParts {
    let name = name.trim();

    let (surname, rest) = if let Some(pos) = name.find(SURNAME_SEPARATORS) {
        (name[..pos].trim(), &name[pos + 1..])
    } else if let Some(pos) = name.rfind(' ') {
        (name[pos + 1..].trim(), &name[..pos])
    } else {
        return NameParts {
            surname: name.to_string(),
            ..NameParts::default()
        };
    };

    let rest = match rest.rfind(',') {
        Some(pos) => &rest[..pos],
        None => rest,
    };

    let mut parts = NameParts {
        surname: surname.to_string(),
        ..NameParts::default()
    };

    let tokens = rest
        .split(|c: char| NAME_SEPARATORS.contains(&c) || c.is_whitespace())
        .filter(|t| !t.is_empty());
    for (pos, token) in tokens.enumerate() {
        let mut chars = token.chars();
        let Some(first) = chars.next() else { continue };
        parts.initials.push(first.to_string());
        if chars.next().is_some() {
            parts.names.push(token.to_string());
            parts.positions.push(pos);
        }
    }

    parts
}

/// Formats parts as `"Surname, First I."`.
#[must_use]
pub fn create_normalized_name(parts: &NameParts) -> String {
    if parts.initials.is_empty() && parts.names.is_empty() {
        return parts.surname.clone();
    }

    let mut out = format!("{},", parts.surname);
    for (i, initial) in parts.initials.iter().enumerate() {
        out.push(' ');
        match parts.positions.iter().position(|p| *p == i) {
            Some(idx) => out.push_str(&parts.names[idx]),
            None => {
                out.push_str(initial);
                out.push('.');
            }
        }
    }
    out
}

/// Picks the most informative spelling among name variants: most full
/// first names, then most initials. The first variant wins ties.
#[must_use]
pub fn most_relevant_name<'a, I>(variants: I) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut best: Option<(usize, usize, NameParts)> = None;
    for variant in variants {
        let parts = split_name_parts(variant);
        let rank = (parts.names.len(), parts.initials.len());
        let better = match &best {
            None => true,
            Some((names, initials, _)) => rank > (*names, *initials),
        };
        if better {
            best = Some((rank.0, rank.1, parts));
        }
    }
    best.map(|(_, _, parts)| create_normalized_name(&parts))
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

/// Builds the base canonical id, e.g. `"Ellis, John Richard"` → `J.R.Ellis`.
///
/// The store appends a numeric suffix to make it unique; see
/// [`unique_canonical_name`].
#[must_use]
pub fn create_canonical_name(name: &str) -> String {
    let parts = split_name_parts(name);
    let mut tokens: Vec<String> = parts.initials.iter().map(|i| clean_string(i)).collect();
    tokens.extend(clean_string(&parts.surname).split_whitespace().map(str::to_string));
    tokens
        .iter()
        .filter(|t| !t.trim().is_empty())
        .map(|t| title_case(t.trim()))
        .collect::<Vec<_>>()
        .join(".")
}

/// Appends the first free `.N` suffix (starting at 1) to `base`.
#[must_use]
pub fn unique_canonical_name(base: &str, taken: &HashSet<String>) -> String {
    let mut n = 1u64;
    loop {
        let candidate = format!("{base}.{n}");
        if !taken.contains(&candidate.to_lowercase()) {
            return candidate;
        }
        n += 1;
    }
}

/// Key shared by all names with the same surname; used to group signatures
/// into score-cache clusters.
#[must_use]
pub fn last_name_cluster(name: &str) -> String {
    let parts = split_name_parts(&remove_parenthesized(name));
    clean_string(&parts.surname)
        .split_whitespace()
        .collect::<String>()
        .to_lowercase()
}

/// Alternative keys tried when the exact matchable name finds nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum NameFunction {
    /// `"smith j r"`: surname plus every initial.
    SurnameInitials,
    /// `"smith j"`: surname plus the first initial.
    SurnameFirstInitial,
    /// `"smith"`: surname alone.
    SurnameOnly,
}

impl NameFunction {
    /// All known functions, in their default precedence.
    pub const ALL: [Self; 3] = [Self::SurnameInitials, Self::SurnameFirstInitial, Self::SurnameOnly];

    /// Computes the lookup key for `name`, or `None` if it would be empty.
    #[must_use]
    pub fn apply(self, name: &str) -> Option<String> {
        let surname = last_name_cluster(name);
        if surname.is_empty() {
            return None;
        }

        let initials: Vec<String> = split_name_parts(&fold_diacritics(name))
            .initials
            .iter()
            .map(|i| i.to_lowercase())
            .filter(|i| i.chars().all(char::is_alphabetic))
            .collect();

        let key = match self {
            Self::SurnameOnly => surname,
            Self::SurnameFirstInitial => match initials.first() {
                Some(first) => format!("{surname} {first}"),
                None => surname,
            },
            Self::SurnameInitials => {
                let mut key = surname;
                for initial in &initials {
                    key.push(' ');
                    key.push_str(initial);
                }
                key
            }
        };
        Some(key)
    }

    /// Configuration name of this function.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SurnameInitials => "surname_initials",
            Self::SurnameFirstInitial => "surname_first_initial",
            Self::SurnameOnly => "surname_only",
        }
    }
}

impl TryFrom<String> for NameFunction {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let value = value.trim();
        Self::ALL
            .into_iter()
            .find(|f| f.as_str().eq_ignore_ascii_case(value))
            .ok_or_else(|| format!("unknown name function: {value}"))
    }
}

impl From<NameFunction> for String {
    fn from(value: NameFunction) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for NameFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `x·y / sqrt(x² + y²) · sqrt(2)`: 1 when both are 1, 0 when either is 0.
fn harmonic(x: f64, y: f64) -> f64 {
    let norm = (x * x + y * y).sqrt();
    if norm == 0.0 {
        return 0.0;
    }
    (x * y) / norm * std::f64::consts::SQRT_2
}

/// Surnames must agree exactly once cleaned; any other difference is a
/// different author.
fn surname_compatibility(a: &str, b: &str) -> f64 {
    let a = clean_string(a);
    let b = clean_string(b);
    if !a.is_empty() && a == b {
        1.0
    } else {
        0.0
    }
}

#[allow(clippy::cast_precision_loss)]
fn initials_compatibility(ia: &[String], ib: &[String]) -> f64 {
    let max_n = ia.len().max(ib.len());
    let set_a: HashSet<&String> = ia.iter().collect();
    let set_b: HashSet<&String> = ib.iter().collect();
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();

    let similarity = if union > 0 {
        intersection as f64 / union as f64
    } else {
        1.0
    };

    let (longer, shorter) = if ia.len() > ib.len() { (ia, ib) } else { (ib, ia) };
    let (lo, lt) = (longer.len(), shorter.len());

    let (screwup, distance) = if max_n > 0 {
        // Mismatches near the end of the longer list weigh less.
        let weighted: usize = longer
            .iter()
            .rev()
            .enumerate()
            .filter(|(i, k)| {
                let j = lo - 1 - i;
                j >= lt || **k != shorter[j]
            })
            .map(|(i, _)| i + 1)
            .sum();
        let triangle = (max_n * (max_n + 1)) as f64 / 2.0;
        let distance = strsim::levenshtein(&ia.concat(), &ib.concat()) as f64 / max_n as f64;
        (weighted as f64 / triangle, distance)
    } else {
        (0.0, 0.0)
    };

    (0.8 * similarity + 0.1 * (1.0 - distance) + 0.1 * (1.0 - screwup)).clamp(0.0, 1.0)
}

fn name_variants(names: &[String]) -> Vec<String> {
    let mut variants = vec![names.join(" ")];
    let len = names.len();
    for span in 2..=len {
        for start in 0..=(len - span) {
            let merged = names[start..start + span].concat();
            let mut words: Vec<&str> = names[..start].iter().map(String::as_str).collect();
            words.push(&merged);
            words.extend(names[start + span..].iter().map(String::as_str));
            variants.push(words.join(" "));
        }
    }
    variants
}

/// True if the names only differ by word splitting: `guangsheng` vs `guang sheng`.
fn names_are_equal_composites(a: &[String], b: &[String]) -> bool {
    let b_variants: HashSet<String> = name_variants(b)
        .iter()
        .map(|v| clean_string(&v.to_lowercase()))
        .collect();
    name_variants(a)
        .iter()
        .any(|v| b_variants.contains(&clean_string(&v.to_lowercase())))
}

/// True if any name of one side is a prefix of a name of the other side.
fn names_are_substrings(a: &[String], b: &[String]) -> bool {
    a.iter().any(|o| {
        let o = clean_string(&o.to_lowercase());
        b.iter().any(|t| {
            let t = clean_string(&t.to_lowercase());
            o.starts_with(&t) || t.starts_with(&o)
        })
    })
}

#[allow(clippy::cast_precision_loss)]
fn screwup_ratio(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 0.0;
    }
    strsim::levenshtein(a, b) as f64 / max_len as f64
}

#[allow(clippy::cast_precision_loss)]
fn compare_first_names(fna: &[String], fnb: &[String]) -> f64 {
    let initials_only = fna.is_empty() || fnb.is_empty();
    let composites = !initials_only && names_are_equal_composites(fna, fnb);
    let substrings = names_are_substrings(fna, fnb);

    let (mut max_s, mut min_s, mut avg_s) = (0.0, 0.0, 0.0);
    if !initials_only {
        let (longer, shorter) = if fna.len() > fnb.len() { (fna, fnb) } else { (fnb, fna) };

        // Positional pairing.
        let positional: Vec<f64> = longer
            .iter()
            .zip(shorter.iter())
            .map(|(k, t)| screwup_ratio(k, t))
            .collect();

        // Greedy best pairing.
        let mut remaining: Vec<&String> = shorter.iter().collect();
        let mut greedy = Vec::new();
        for name in longer {
            if remaining.is_empty() {
                break;
            }
            let (best_idx, best) = remaining
                .iter()
                .enumerate()
                .map(|(i, k)| (i, screwup_ratio(name, k)))
                .fold((0, f64::INFINITY), |acc, cur| if cur.1 < acc.1 { cur } else { acc });
            greedy.push(best);
            remaining.remove(best_idx);
        }

        max_s = positional.iter().copied().fold(0.0, f64::max);
        min_s = greedy.iter().copied().fold(f64::INFINITY, f64::min);
        avg_s = (positional.iter().sum::<f64>() / positional.len() as f64
            + greedy.iter().sum::<f64>() / greedy.len() as f64)
            / 2.0;
    }

    let original_max = max_s;
    if max_s > 0.1 {
        max_s = 1.0;
        min_s = 1.0;
        avg_s = 1.0;
    }

    let mut score: f64 = (1.0 - (0.25 * max_s + 0.5 * avg_s + 0.25 * min_s)).max(0.0);

    if composites && substrings {
        score = (score + 0.7).min(1.0);
    } else if substrings {
        score = (score + ((1.0 - original_max) * 0.75).max(0.0)).min(1.0);
    }

    score
}

/// Scores how likely two raw names denote the same person, in `[0, 1]`.
///
/// Surnames must agree exactly after cleaning; given names and initials
/// then scale the result.
#[must_use]
pub fn compare_names(origin: &str, target: &str) -> f64 {
    let no = split_name_parts(&fold_diacritics(origin)).to_lowercase();
    let nt = split_name_parts(&fold_diacritics(target)).to_lowercase();

    let surname_score = surname_compatibility(&no.surname, &nt.surname);
    let initials_only = no.names.is_empty() || nt.names.is_empty();
    let initials_score = initials_compatibility(&no.initials, &nt.initials);
    let first_names_score = compare_first_names(&no.names, &nt.names);

    let given_score = if initials_only {
        initials_score * 0.6
    } else {
        harmonic(initials_score, first_names_score)
    };

    harmonic(surname_score, given_score).clamp(0.0, 1.0)
}
