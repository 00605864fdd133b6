//! Lemma edit rules
//!
//! A lemma is predicted as three independent classes: a casing rule and two
//! edit scripts that rewrite the start and the end of the (case-folded) form
//! around the longest substring it shares with the lemma. Edit scripts are
//! written `-{n}+{s}`: drop `n` characters, then add `s`.

use std::collections::BTreeMap;

/// Rule type names, in head order
pub const RULE_TYPES: [&str; 3] = ["case", "prefix", "suffix"];

const CASE_LOWER: &str = "lower";
const CASE_UPPER: &str = "upper";
const CASE_TITLE: &str = "title";
const CASE_FORM: &str = "form";

/// One rule string per rule type
pub type LemmaRule = BTreeMap<String, String>;

fn title_case(lower: &str) -> String {
    let mut chars = lower.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn casing(lemma: &str) -> &'static str {
    let lower = lemma.to_lowercase();
    if lower == lemma {
        CASE_LOWER
    } else if lower.to_uppercase() == lemma {
        CASE_UPPER
    } else if title_case(&lower) == lemma {
        CASE_TITLE
    } else {
        CASE_FORM
    }
}

/// Start and length of the longest common substring, as `(a_start, b_start, len)`
fn longest_common_substring(a: &[char], b: &[char]) -> (usize, usize, usize) {
    let mut best = (0, 0, 0);
    let mut previous = vec![0usize; b.len() + 1];
    for i in 1..=a.len() {
        let mut current = vec![0usize; b.len() + 1];
        for j in 1..=b.len() {
            if a[i - 1] == b[j - 1] {
                current[j] = previous[j - 1] + 1;
                if current[j] > best.2 {
                    best = (i - current[j], j - current[j], current[j]);
                }
            }
        }
        previous = current;
    }
    best
}

fn edit_script(drop: usize, add: &[char]) -> String {
    format!("-{}+{}", drop, add.iter().collect::<String>())
}

fn parse_script(script: &str) -> Option<(usize, &str)> {
    let rest = script.strip_prefix('-')?;
    let (drop, add) = rest.split_once('+')?;
    Some((drop.parse().ok()?, add))
}

/// Rules rewriting `form` into `lemma`
pub fn gen_lemma_rule(form: &str, lemma: &str) -> LemmaRule {
    let case = casing(lemma);
    let (source, target) = if case == CASE_FORM {
        (form.to_string(), lemma.to_string())
    } else {
        (form.to_lowercase(), lemma.to_lowercase())
    };
    let source: Vec<char> = source.chars().collect();
    let target: Vec<char> = target.chars().collect();

    let (prefix, suffix) = match longest_common_substring(&source, &target) {
        (_, _, 0) => (edit_script(source.len(), &target), edit_script(0, &[])),
        (s, t, len) => (
            edit_script(s, &target[..t]),
            edit_script(source.len() - s - len, &target[t + len..]),
        ),
    };

    let mut rule = LemmaRule::new();
    rule.insert("case".to_string(), case.to_string());
    rule.insert("prefix".to_string(), prefix);
    rule.insert("suffix".to_string(), suffix);
    rule
}

/// Apply `rule` to `form`; malformed or missing scripts leave that edit out
pub fn apply_lemma_rule(form: &str, rule: &LemmaRule) -> String {
    let case = rule.get("case").map(String::as_str).unwrap_or(CASE_LOWER);
    let working = if case == CASE_FORM {
        form.to_string()
    } else {
        form.to_lowercase()
    };
    let mut chars: Vec<char> = working.chars().collect();

    if let Some((drop, add)) = rule.get("prefix").and_then(|s| parse_script(s)) {
        let drop = drop.min(chars.len());
        chars = add.chars().chain(chars[drop..].iter().copied()).collect();
    }
    if let Some((drop, add)) = rule.get("suffix").and_then(|s| parse_script(s)) {
        let keep = chars.len().saturating_sub(drop);
        chars.truncate(keep);
        chars.extend(add.chars());
    }

    let lemma: String = chars.into_iter().collect();
    match case {
        CASE_UPPER => lemma.to_uppercase(),
        CASE_TITLE => title_case(&lemma),
        _ => lemma,
    }
}
