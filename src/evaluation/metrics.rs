//! Shared-task metrics for identically tokenized treebanks
//!
//! Gold and system words are aligned one-to-one, so every word-level metric
//! has equal gold, system and aligned totals. CLAS, MLAS and BLEX only count
//! words attached with a content relation, which is decided separately on each
//! side, so their precision and recall can differ.

use std::collections::HashMap;

use tracing::debug;

use super::{EvaluationError, EvaluationReport, Evaluator, Score};
use crate::treebank::{Sentence, TokenId, Treebank};

const CONTENT_DEPRELS: [&str; 29] = [
    "nsubj", "obj", "iobj", "csubj", "ccomp", "xcomp", "obl", "vocative", "expl", "dislocated",
    "advcl", "advmod", "discourse", "nmod", "appos", "nummod", "acl", "amod", "conj", "fixed",
    "flat", "compound", "list", "parataxis", "orphan", "goeswith", "reparandum", "root", "dep",
];

const FUNCTIONAL_DEPRELS: [&str; 7] = ["aux", "cop", "mark", "det", "clf", "case", "cc"];

const UNIVERSAL_FEATURES: [&str; 21] = [
    "PronType", "NumType", "Poss", "Reflex", "Foreign", "Abbr", "Gender", "Animacy", "Number",
    "Case", "Definite", "Degree", "VerbForm", "Mood", "Tense", "Aspect", "Voice", "Evident",
    "Polarity", "Person", "Polite",
];

/// A word reduced to what the metrics compare
#[derive(Debug, Clone)]
struct ScoredWord {
    form: String,
    lemma: String,
    upos: String,
    xpos: String,
    /// Universal features only, sorted
    feats: String,
    /// Relation without subtype
    deprel: String,
    /// Head as a file-wide word index, `None` for the root
    head: Option<usize>,
    functional_children: Vec<usize>,
}

impl ScoredWord {
    fn is_content(&self) -> bool {
        CONTENT_DEPRELS.contains(&self.deprel.as_str())
    }

    fn is_functional(&self) -> bool {
        FUNCTIONAL_DEPRELS.contains(&self.deprel.as_str())
    }
}

fn universal_feats(feats: &str) -> String {
    let mut kept: Vec<&str> = feats
        .split('|')
        .filter(|feat| {
            let name = feat.split('=').next().unwrap_or(*feat);
            UNIVERSAL_FEATURES.contains(&name)
        })
        .collect();
    kept.sort_unstable();
    kept.join("|")
}

fn universal_deprel(deprel: &str) -> &str {
    deprel.split(':').next().unwrap_or(deprel)
}

/// Validate one sentence's heads and append its words
fn push_sentence(
    words: &mut Vec<ScoredWord>,
    sentence: &Sentence,
    sentence_index: usize,
) -> Result<(), EvaluationError> {
    let offset = words.len();
    let tokens: Vec<_> = sentence.words().collect();
    let positions: HashMap<usize, usize> = tokens
        .iter()
        .enumerate()
        .filter_map(|(position, token)| match token.id {
            TokenId::Word(id) => Some((id, position)),
            _ => None,
        })
        .collect();

    let mut heads = Vec::with_capacity(tokens.len());
    for token in &tokens {
        let word = match token.id {
            TokenId::Word(id) => id,
            _ => 0,
        };
        let head = token.head.ok_or_else(|| EvaluationError::InvalidHead {
            sentence: sentence_index,
            word,
            reason: "head is missing".to_string(),
        })?;
        let head = match head {
            0 => None,
            h => Some(*positions.get(&h).ok_or_else(|| EvaluationError::InvalidHead {
                sentence: sentence_index,
                word,
                reason: format!("head {} points outside of the sentence", h),
            })?),
        };
        heads.push(head);
    }

    if heads.iter().filter(|head| head.is_none()).count() > 1 {
        return Err(EvaluationError::MultipleRoots {
            sentence: sentence_index,
        });
    }
    for &start in &heads {
        let mut current = start;
        let mut steps = 0;
        while let Some(position) = current {
            steps += 1;
            if steps > heads.len() {
                return Err(EvaluationError::Cycle {
                    sentence: sentence_index,
                });
            }
            current = heads[position];
        }
    }

    for (token, head) in tokens.iter().zip(&heads) {
        words.push(ScoredWord {
            form: token.form.clone(),
            lemma: token.lemma.clone(),
            upos: token.upos.clone(),
            xpos: token.xpos.clone(),
            feats: universal_feats(&token.feats),
            deprel: universal_deprel(&token.deprel).to_string(),
            head: head.map(|position| offset + position),
            functional_children: Vec::new(),
        });
    }
    for index in offset..words.len() {
        if let Some(head) = words[index].head {
            if words[index].is_functional() {
                words[head].functional_children.push(index);
            }
        }
    }
    Ok(())
}

fn scored_words(treebank: &Treebank) -> Result<Vec<ScoredWord>, EvaluationError> {
    let mut words = Vec::new();
    for (index, sentence) in treebank.sentences.iter().enumerate() {
        push_sentence(&mut words, sentence, index)?;
    }
    Ok(words)
}

fn align(gold: &[ScoredWord], system: &[ScoredWord]) -> Result<(), EvaluationError> {
    let len = gold.len().max(system.len());
    for index in 0..len {
        let gold_form = gold.get(index).map(|w| w.form.as_str());
        let system_form = system.get(index).map(|w| w.form.as_str());
        if gold_form != system_form {
            return Err(EvaluationError::WordMismatch {
                index,
                gold: gold_form.unwrap_or_default().to_string(),
                system: system_form.unwrap_or_default().to_string(),
            });
        }
    }
    Ok(())
}

/// Aligned gold and system words
struct Alignment<'a> {
    gold: &'a [ScoredWord],
    system: &'a [ScoredWord],
}

impl Alignment<'_> {
    fn score(&self, filter: impl Fn(&ScoredWord) -> bool, correct: impl Fn(&ScoredWord, &ScoredWord) -> bool) -> Score {
        let gold_total = self.gold.iter().filter(|&w| filter(w)).count();
        let system_total = self.system.iter().filter(|&w| filter(w)).count();
        let matched = self
            .gold
            .iter()
            .zip(self.system)
            .filter(|&(g, s)| filter(g) && correct(g, s))
            .count();
        Score::new(gold_total, system_total, matched, gold_total)
    }

    fn lemma_matches(gold: &ScoredWord, system: &ScoredWord) -> bool {
        gold.lemma == "_" || gold.lemma == system.lemma
    }

    fn attachment_matches(gold: &ScoredWord, system: &ScoredWord) -> bool {
        gold.head == system.head && gold.deprel == system.deprel
    }

    fn functional_children_match(&self, gold: &ScoredWord, system: &ScoredWord) -> bool {
        gold.functional_children.len() == system.functional_children.len()
            && gold
                .functional_children
                .iter()
                .zip(&system.functional_children)
                .all(|(&g, &s)| {
                    // same aligned word, then same attachment and tags
                    let (gold_child, system_child) = (&self.gold[g], &self.system[s]);
                    g == s
                        && gold_child.head == system_child.head
                        && gold_child.deprel == system_child.deprel
                        && gold_child.upos == system_child.upos
                        && gold_child.feats == system_child.feats
                })
    }
}

/// Shared-task evaluator for files with identical tokenization
#[derive(Debug, Clone, Copy, Default)]
pub struct Conll18Evaluator;

impl Evaluator for Conll18Evaluator {
    fn evaluate(&self, gold: &Treebank, system: &Treebank) -> Result<EvaluationReport, EvaluationError> {
        let gold_words = scored_words(gold)?;
        let system_words = scored_words(system)?;
        align(&gold_words, &system_words)?;
        debug!("Scoring {} aligned words", gold_words.len());

        let alignment = Alignment {
            gold: &gold_words,
            system: &system_words,
        };
        let all = |_: &ScoredWord| true;
        let content = |w: &ScoredWord| w.is_content();

        let mut report = EvaluationReport::default();
        report.insert("UPOS", alignment.score(all, |g, s| g.upos == s.upos));
        report.insert("XPOS", alignment.score(all, |g, s| g.xpos == s.xpos));
        report.insert("UFeats", alignment.score(all, |g, s| g.feats == s.feats));
        report.insert(
            "AllTags",
            alignment.score(all, |g, s| g.upos == s.upos && g.xpos == s.xpos && g.feats == s.feats),
        );
        report.insert("Lemmas", alignment.score(all, Alignment::lemma_matches));
        report.insert("UAS", alignment.score(all, |g, s| g.head == s.head));
        report.insert("LAS", alignment.score(all, Alignment::attachment_matches));
        report.insert("CLAS", alignment.score(content, Alignment::attachment_matches));
        report.insert(
            "MLAS",
            alignment.score(content, |g, s| {
                Alignment::attachment_matches(g, s)
                    && g.upos == s.upos
                    && g.feats == s.feats
                    && alignment.functional_children_match(g, s)
            }),
        );
        report.insert(
            "BLEX",
            alignment.score(content, |g, s| {
                Alignment::attachment_matches(g, s) && Alignment::lemma_matches(g, s)
            }),
        );
        Ok(report)
    }
}
