//! Trigger detection over LLM output.
//!
//! Detection is case-insensitive substring containment of the entity's
//! configured name or term; when several entities match, the first in
//! configuration order wins. A matched mention either *replaces* the LLM
//! message (the model basically just said the trigger) or the sequence is
//! *appended* after it.

use regex::Regex;

/// Case-insensitive containment. Terms are matched embedded, not on word
/// boundaries — "Confira o curso PREMIUM" triggers "Curso Premium" because
/// the comparison runs over lowercased text.
pub fn contains_term(haystack: &str, term: &str) -> bool {
    if term.is_empty() {
        return false;
    }
    haystack.to_lowercase().contains(&term.to_lowercase())
}

/// First item (configuration order) whose name appears in `text`.
pub fn first_match<'a, T>(
    text: &str,
    items: &'a [T],
    name_of: impl Fn(&T) -> Option<&str>,
) -> Option<&'a T> {
    items
        .iter()
        .find(|item| name_of(item).is_some_and(|name| contains_term(text, name)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Substitution {
    /// The mention dominates a short message: suppress the LLM text and send
    /// only the block sequence.
    Replace,
    /// Send the LLM text, then the block sequence.
    Append,
}

/// Replace when the mention is at least 70% of the output and the output is
/// under 50 chars; append otherwise.
pub fn substitution_policy(output: &str, term: &str) -> Substitution {
    let total = output.trim().chars().count();
    let mention = term.chars().count();
    if total < 50 && mention * 100 >= total * 70 {
        Substitution::Replace
    } else {
        Substitution::Append
    }
}

/// Match `{term}{amount}` (case-insensitive, embedded) and return the amount
/// in cents. Accepts `49`, `49.90`, and `49,90` immediately after the term,
/// with optional whitespace.
pub fn find_discount_amount(text: &str, term: &str) -> Option<i64> {
    if term.is_empty() {
        return None;
    }
    let pattern = format!(
        r"(?i){}\s*(\d+)(?:[.,](\d{{1,2}}))?",
        regex::escape(term)
    );
    let re = Regex::new(&pattern).ok()?;
    let caps = re.captures(text)?;
    let reais: i64 = caps.get(1)?.as_str().parse().ok()?;
    let cents_frac = match caps.get(2) {
        Some(frac) => {
            let digits = frac.as_str();
            let value: i64 = digits.parse().ok()?;
            if digits.len() == 1 {
                value * 10
            } else {
                value
            }
        }
        None => 0,
    };
    let total = reais * 100 + cents_frac;
    (total > 0).then_some(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn containment_is_case_insensitive_and_embedded() {
        assert!(contains_term("Confira o curso PREMIUM agora", "Curso Premium"));
        assert!(contains_term("cursopremium", "Curso"));
        assert!(!contains_term("Confira o plano", "Curso Premium"));
        assert!(!contains_term("anything", ""));
    }

    #[test]
    fn first_match_respects_configuration_order() {
        let offers = vec![("Curso Premium", 1), ("Curso", 2)];
        let hit = first_match("quero o curso", &offers, |o| Some(o.0)).unwrap();
        // Both match, the first configured wins.
        assert_eq!(hit.1, 1);
    }

    #[test]
    fn short_dominated_output_replaces() {
        // Mention is the whole of a short output.
        assert_eq!(
            substitution_policy("Curso Premium", "Curso Premium"),
            Substitution::Replace
        );
        // Mention is 13 of 17 chars (76%) in a sub-50 output.
        assert_eq!(
            substitution_policy("O Curso Premium!", "Curso Premium"),
            Substitution::Replace
        );
    }

    #[test]
    fn long_or_partial_output_appends() {
        // S3: partial mention inside a normal sentence appends.
        assert_eq!(
            substitution_policy("Temos o Curso Premium ideal para você começar hoje", "Curso Premium"),
            Substitution::Append
        );
        // ≥50 chars always appends even when dominated.
        let long = format!("{} {}", "Curso Premium", "x".repeat(40));
        assert_eq!(substitution_policy(&long, "Curso Premium"), Substitution::Append);
    }

    #[test]
    fn discount_amount_forms() {
        assert_eq!(find_discount_amount("DESCONTO49", "desconto"), Some(49_00));
        assert_eq!(find_discount_amount("desconto 49.90", "DESCONTO"), Some(49_90));
        assert_eq!(find_discount_amount("use desconto49,9 hoje", "desconto"), Some(49_90));
        assert_eq!(find_discount_amount("sem oferta aqui", "desconto"), None);
        assert_eq!(find_discount_amount("desconto0", "desconto"), None);
    }

    #[test]
    fn discount_term_is_escaped() {
        // A term with regex metacharacters must not panic or misfire.
        assert_eq!(find_discount_amount("promo(vip)25", "promo(vip)"), Some(25_00));
    }
}
