//! Termination predicates.
//!
//! A predicate is a pure function `(Message) -> Option<TerminationReason>`.
//! The controller evaluates it after every appended message, agreement before
//! rejection, and falls back to the turn budget when neither fires. Swap in a
//! stricter classifier by implementing [`TerminationPredicate`].
//!
//! [`LexiconPredicate`] matches whole-word phrases against an agreement and a
//! rejection lexicon. A phrase preceded by a negator in the same clause does
//! not fire, so "I do not want to reject this" is not a rejection and
//! "we haven't agreed" is not an agreement. Questions never fire, and a bare
//! "deal" only counts as a clause of its own ("Deal, £1300 works").
//!
//! ```
//! use rentnego::termination::{LexiconPredicate, TerminationPredicate};
//! use rentnego::{Message, Role, TerminationReason};
//!
//! let predicate = LexiconPredicate::default();
//! let msg = Message::new("s", "t1", Role::Tenant, "Deal, £1300 works, agreement reached");
//! assert_eq!(predicate.evaluate(&msg), Some(TerminationReason::Agreement));
//!
//! let msg = Message::new("s", "t1", Role::Tenant, "I do not want to reject this");
//! assert_eq!(predicate.evaluate(&msg), None);
//!
//! let msg = Message::new("s", "t1", Role::Tenant, "What deal could you offer on parking?");
//! assert_eq!(predicate.evaluate(&msg), None);
//! ```

use crate::negotiation::model::{AgreementDetails, Message, TerminationReason};

/// Decides whether a message ends the negotiation.
pub trait TerminationPredicate: Send + Sync {
    fn evaluate(&self, message: &Message) -> Option<TerminationReason>;
}

impl<F> TerminationPredicate for F
where
    F: Fn(&Message) -> Option<TerminationReason> + Send + Sync,
{
    fn evaluate(&self, message: &Message) -> Option<TerminationReason> {
        self(message)
    }
}

const AGREEMENT_PHRASES: &[&str] = &[
    "agreement reached",
    "we have an agreement",
    "we have a deal",
    "you have a deal",
    "it's a deal",
    "i accept",
    "accept your offer",
    "offer accepted",
    "agreed",
    "sign the contract",
    "ready to sign",
    "seal the deal",
];

/// Agreement phrases that only fire when they make up a whole clause.
const STANDALONE_AGREEMENT: &[&str] = &["deal", "done deal"];

const REJECTION_PHRASES: &[&str] = &[
    "no deal",
    "reject",
    "rejected",
    "i decline",
    "decline your offer",
    "not interested",
    "walk away",
    "walking away",
    "end the negotiation",
    "end negotiations",
];

const NEGATORS: &[&str] = &[
    "not", "no", "never", "don't", "dont", "won't", "wont", "cannot", "can't", "cant",
    "isn't", "isnt", "aren't", "arent", "wasn't", "wasnt", "weren't", "werent", "haven't",
    "havent", "hasn't", "hasnt", "hadn't", "hadnt", "wouldn't", "wouldnt", "shouldn't",
    "shouldnt", "couldn't", "couldnt", "didn't", "didnt", "doesn't", "doesnt", "without",
    "neither", "nor",
];

/// Keyword-based predicate with clause-scoped negation.
#[derive(Debug, Clone)]
pub struct LexiconPredicate {
    agreement: Vec<Vec<String>>,
    standalone: Vec<Vec<String>>,
    rejection: Vec<Vec<String>>,
    negators: Vec<String>,
}

impl Default for LexiconPredicate {
    fn default() -> Self {
        Self::new(AGREEMENT_PHRASES, REJECTION_PHRASES)
    }
}

impl LexiconPredicate {
    pub fn new(agreement: &[&str], rejection: &[&str]) -> Self {
        Self {
            agreement: agreement.iter().map(|p| tokenize(p)).collect(),
            standalone: STANDALONE_AGREEMENT.iter().map(|p| tokenize(p)).collect(),
            rejection: rejection.iter().map(|p| tokenize(p)).collect(),
            negators: NEGATORS.iter().map(|n| n.to_string()).collect(),
        }
    }

    /// Add an agreement phrase.
    pub fn with_agreement_phrase(mut self, phrase: &str) -> Self {
        self.agreement.push(tokenize(phrase));
        self
    }

    /// Add a rejection phrase.
    pub fn with_rejection_phrase(mut self, phrase: &str) -> Self {
        self.rejection.push(tokenize(phrase));
        self
    }

    /// Index of the first clause that states agreement.
    fn agreement_clause(&self, clauses: &[Clause<'_>]) -> Option<usize> {
        clauses.iter().position(|clause| {
            let tokens = tokenize(clause.text);
            !clause.question
                && (self.standalone.iter().any(|phrase| tokens == *phrase)
                    || self
                        .agreement
                        .iter()
                        .any(|phrase| self.phrase_fires(&tokens, phrase)))
        })
    }

    fn rejects(&self, clauses: &[Clause<'_>]) -> bool {
        clauses.iter().filter(|clause| !clause.question).any(|clause| {
            let tokens = tokenize(clause.text);
            self.rejection
                .iter()
                .any(|phrase| self.phrase_fires(&tokens, phrase))
        })
    }

    fn phrase_fires(&self, tokens: &[String], phrase: &[String]) -> bool {
        if phrase.is_empty() || phrase.len() > tokens.len() {
            return false;
        }
        (0..=tokens.len() - phrase.len()).any(|start| {
            tokens[start..start + phrase.len()] == *phrase
                && !tokens[..start].iter().any(|t| self.negators.contains(t))
        })
    }
}

impl TerminationPredicate for LexiconPredicate {
    fn evaluate(&self, message: &Message) -> Option<TerminationReason> {
        let clauses = clauses(&message.content);
        if self.agreement_clause(&clauses).is_some() {
            Some(TerminationReason::Agreement)
        } else if self.rejects(&clauses) {
            Some(TerminationReason::Rejected)
        } else {
            None
        }
    }
}

/// Pull the agreed terms out of the message that triggered agreement.
///
/// The price is the first amount in the clause that states agreement, else
/// the nearest one after it, else the nearest one before it. When no lexicon
/// phrase is found (a custom predicate fired) the last amount is used.
pub fn agreement_details(message: &Message, turn: u32) -> AgreementDetails {
    let (price, currency) = match agreed_amount(&message.content) {
        Some((amount, currency)) => (Some(amount), currency),
        None => (None, None),
    };
    AgreementDetails {
        price,
        currency,
        turn,
        participant_id: message.participant_id.clone(),
        role: message.role,
    }
}

fn agreed_amount(text: &str) -> Option<(f64, Option<String>)> {
    let clauses = clauses(text);
    match LexiconPredicate::default().agreement_clause(&clauses) {
        Some(at) => clauses[at..]
            .iter()
            .find_map(|clause| amounts(clause.text).into_iter().next())
            .or_else(|| {
                clauses[..at]
                    .iter()
                    .rev()
                    .find_map(|clause| amounts(clause.text).pop())
            }),
        None => last_amount(text),
    }
}

/// Last monetary amount in `text`, with the currency inferred from a leading
/// symbol (`£`, `$`, `€`) or a trailing code.
pub fn last_amount(text: &str) -> Option<(f64, Option<String>)> {
    amounts(text).pop()
}

/// Monetary amounts in `text`, in order. Bare numbers below 100 are skipped.
fn amounts(text: &str) -> Vec<(f64, Option<String>)> {
    let chars: Vec<char> = text.chars().collect();
    let mut found = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let symbol = currency_for_symbol(chars[i]);
        let start = if symbol.is_some() { i + 1 } else { i };
        if start < chars.len()
            && chars[start].is_ascii_digit()
            && (symbol.is_some() || i == 0 || !chars[i - 1].is_alphanumeric())
        {
            let mut end = start;
            let mut digits = String::new();
            while end < chars.len()
                && (chars[end].is_ascii_digit() || chars[end] == ',' || chars[end] == '.')
            {
                if chars[end] != ',' {
                    digits.push(chars[end]);
                }
                end += 1;
            }
            let digits = digits.trim_end_matches('.');
            if let Ok(amount) = digits.parse::<f64>() {
                let currency = symbol
                    .map(str::to_string)
                    .or_else(|| trailing_code(&chars[end..]));
                if currency.is_some() || amount >= 100.0 {
                    found.push((amount, currency));
                }
            }
            i = end.max(i + 1);
        } else {
            i += 1;
        }
    }
    found
}

fn currency_for_symbol(c: char) -> Option<&'static str> {
    match c {
        '£' => Some("GBP"),
        '$' => Some("USD"),
        '€' => Some("EUR"),
        _ => None,
    }
}

fn trailing_code(rest: &[char]) -> Option<String> {
    let word: String = rest
        .iter()
        .skip_while(|c| c.is_whitespace())
        .take_while(|c| c.is_alphabetic())
        .collect::<String>()
        .to_ascii_lowercase();
    match word.as_str() {
        "gbp" | "pounds" | "pound" => Some("GBP".to_string()),
        "usd" | "dollars" | "dollar" => Some("USD".to_string()),
        "eur" | "euros" | "euro" => Some("EUR".to_string()),
        _ => None,
    }
}

struct Clause<'a> {
    text: &'a str,
    question: bool,
}

/// Split on clause punctuation, keeping separators inside numbers
/// ("£1,400.50") with their clause.
fn clauses(text: &str) -> Vec<Clause<'_>> {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let mut found = Vec::new();
    let mut start = 0;
    for (k, &(at, c)) in chars.iter().enumerate() {
        if !matches!(c, '.' | ',' | ';' | ':' | '!' | '?' | '\n' | '(' | ')') {
            continue;
        }
        let in_number = matches!(c, '.' | ',')
            && k > 0
            && k + 1 < chars.len()
            && chars[k - 1].1.is_ascii_digit()
            && chars[k + 1].1.is_ascii_digit();
        if in_number {
            continue;
        }
        push_clause(&mut found, &text[start..at], c == '?');
        start = at + c.len_utf8();
    }
    push_clause(&mut found, &text[start..], false);
    found
}

fn push_clause<'a>(found: &mut Vec<Clause<'a>>, text: &'a str, question: bool) {
    if !text.trim().is_empty() {
        found.push(Clause { text, question });
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .replace(['\u{2019}', '\u{2018}'], "'")
        .split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .map(|t| t.trim_matches('\''))
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::negotiation::model::Role;

    fn eval(text: &str) -> Option<TerminationReason> {
        LexiconPredicate::default().evaluate(&Message::new("s", "p", Role::Tenant, text))
    }

    #[test]
    fn test_offers_do_not_terminate() {
        assert_eq!(eval("I'd like £1200"), None);
        assert_eq!(eval("I can do £1400"), None);
    }

    #[test]
    fn test_agreement_has_priority_over_rejection() {
        assert_eq!(
            eval("We have a deal, I reject the earlier draft"),
            Some(TerminationReason::Agreement)
        );
    }

    #[test]
    fn test_negated_phrases_do_not_fire() {
        assert_eq!(eval("I do not want to reject this"), None);
        assert_eq!(eval("I don't think we have a deal yet"), None);
        assert_eq!(eval("That's no deal"), Some(TerminationReason::Rejected));
    }

    #[test]
    fn test_whole_word_matching() {
        assert_eq!(eval("This is a big ideal for us"), None);
        assert_eq!(eval("I'm not interested anymore"), Some(TerminationReason::Rejected));
    }

    #[test]
    fn test_contracted_negators() {
        assert_eq!(eval("We haven't agreed on anything yet"), None);
        assert_eq!(eval("The landlord hasn't agreed to pets"), None);
        assert_eq!(eval("That wasn't rejected outright"), None);
        assert_eq!(eval("Weren't you the one who rejected it"), None);
    }

    #[test]
    fn test_bare_deal_needs_its_own_clause() {
        assert_eq!(eval("What deal could you offer on parking?"), None);
        assert_eq!(eval("The deal on parking is separate from rent"), None);
        assert_eq!(eval("Deal, £1300 works"), Some(TerminationReason::Agreement));
        assert_eq!(eval("£1300 then. Deal!"), Some(TerminationReason::Agreement));
    }

    #[test]
    fn test_questions_do_not_terminate() {
        assert_eq!(eval("£1300 and we have a deal?"), None);
        assert_eq!(eval("Should I just walk away?"), None);
        assert_eq!(
            eval("Is that your best? Then I accept £1350"),
            Some(TerminationReason::Agreement)
        );
    }

    #[test]
    fn test_agreed_price_comes_from_the_agreeing_clause() {
        let details = |text: &str| {
            agreement_details(&Message::new("s", "p", Role::Tenant, text), 4).price
        };
        assert_eq!(details("Deal, £1300 works (down from £1,400.50)"), Some(1300.0));
        assert_eq!(details("We have a deal at £1350 (you asked £1400)"), Some(1350.0));
        assert_eq!(details("Fine, £1350 it is, agreed"), Some(1350.0));
        assert_eq!(details("£1325 a month. Agreed"), Some(1325.0));
        assert_eq!(details("Agreed, no haggling"), None);
    }

    #[test]
    fn test_last_amount_prefers_latest_mention() {
        assert_eq!(
            last_amount("Deal, £1300 works (down from £1,400.50)"),
            Some((1400.5, Some("GBP".to_string())))
        );
        assert_eq!(
            last_amount("Agreed at 1250 pounds"),
            Some((1250.0, Some("GBP".to_string())))
        );
        assert_eq!(last_amount("See you at 5"), None);
    }
}
