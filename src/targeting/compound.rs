//! Compound target expressions.
//!
//! Words are separated by whitespace. Operators are `and`, `or`, `not` and
//! standalone `(` / `)`. A word is either an engine-prefixed matcher
//! (`G@os:Ubuntu`, `E@web\d+`, `L@a,b`, `N@group`, ...) or a bare glob on
//! the minion id. `not` binds tightest, then `and`, then `or`; a `not`
//! directly after an operand implies `and`.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::TargetResolutionError;
use crate::protocol::MinionId;
use crate::targeting::matcher::{compile_glob, compile_pcre, match_data, LeafMode, DEFAULT_DELIMITER};
use crate::targeting::{MinionData, Resolution};

/// Nodegroups may reference other nodegroups; this bounds the expansion.
const MAX_NODEGROUP_DEPTH: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    And,
    Or,
    Not,
    Open,
    Close,
    Word(String),
}

fn tokenize(expr: &str) -> Vec<Token> {
    expr.split_whitespace()
        .map(|w| match w {
            "and" => Token::And,
            "or" => Token::Or,
            "not" => Token::Not,
            "(" => Token::Open,
            ")" => Token::Close,
            other => Token::Word(other.to_string()),
        })
        .collect()
}

pub(crate) struct CompoundEngine<'a> {
    minions: &'a BTreeMap<MinionId, MinionData>,
    nodegroups: &'a BTreeMap<String, String>,
}

impl<'a> CompoundEngine<'a> {
    pub(crate) fn new(
        minions: &'a BTreeMap<MinionId, MinionData>,
        nodegroups: &'a BTreeMap<String, String>,
    ) -> Self {
        Self {
            minions,
            nodegroups,
        }
    }

    pub(crate) fn evaluate(&self, expr: &str) -> Result<Resolution, TargetResolutionError> {
        let mut missing = BTreeSet::new();
        let minions = self.evaluate_at_depth(expr, 0, &mut missing)?;
        Ok(Resolution { minions, missing })
    }

    pub(crate) fn nodegroup(&self, name: &str) -> Result<Resolution, TargetResolutionError> {
        let expr = self
            .nodegroups
            .get(name)
            .ok_or_else(|| TargetResolutionError::UnknownNodegroup(name.to_string()))?;
        self.evaluate(expr)
    }

    fn evaluate_at_depth(
        &self,
        expr: &str,
        depth: usize,
        missing: &mut BTreeSet<MinionId>,
    ) -> Result<BTreeSet<MinionId>, TargetResolutionError> {
        let tokens = tokenize(expr);
        if tokens.is_empty() {
            return Err(TargetResolutionError::Empty);
        }
        let mut parser = Parser {
            engine: self,
            expr,
            tokens,
            pos: 0,
            depth,
            negated: 0,
            missing,
        };
        let result = parser.or_expr()?;
        if parser.pos < parser.tokens.len() {
            return Err(parser.invalid(format!(
                "unexpected {:?} at position {}",
                parser.tokens[parser.pos], parser.pos
            )));
        }
        Ok(result)
    }

    fn all(&self) -> BTreeSet<MinionId> {
        self.minions.keys().cloned().collect()
    }
}

struct Parser<'e, 'a> {
    engine: &'e CompoundEngine<'a>,
    expr: &'e str,
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
    negated: usize,
    missing: &'e mut BTreeSet<MinionId>,
}

impl Parser<'_, '_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn invalid(&self, reason: impl Into<String>) -> TargetResolutionError {
        TargetResolutionError::InvalidCompound {
            expr: self.expr.to_string(),
            reason: reason.into(),
        }
    }

    fn or_expr(&mut self) -> Result<BTreeSet<MinionId>, TargetResolutionError> {
        let mut left = self.and_expr()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.and_expr()?;
            left = left.union(&right).cloned().collect();
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<BTreeSet<MinionId>, TargetResolutionError> {
        let mut left = self.unary()?;
        loop {
            match self.peek() {
                Some(Token::And) => self.pos += 1,
                Some(Token::Not) => {}
                Some(Token::Word(_)) | Some(Token::Open) => {
                    return Err(self.invalid("missing operator between operands"));
                }
                _ => break,
            }
            let right = self.unary()?;
            left = left.intersection(&right).cloned().collect();
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<BTreeSet<MinionId>, TargetResolutionError> {
        match self.tokens.get(self.pos).cloned() {
            Some(Token::Not) => {
                self.pos += 1;
                self.negated += 1;
                let inner = self.unary();
                self.negated -= 1;
                let inner = inner?;
                Ok(self.engine.all().difference(&inner).cloned().collect())
            }
            Some(Token::Open) => {
                self.pos += 1;
                let inner = self.or_expr()?;
                if self.peek() != Some(&Token::Close) {
                    return Err(self.invalid("unbalanced parenthesis"));
                }
                self.pos += 1;
                Ok(inner)
            }
            Some(Token::Word(word)) => {
                self.pos += 1;
                self.word(&word)
            }
            Some(other) => Err(self.invalid(format!("unexpected {other:?}"))),
            None => Err(self.invalid("expression ends with an operator")),
        }
    }

    fn word(&mut self, word: &str) -> Result<BTreeSet<MinionId>, TargetResolutionError> {
        let Some((engine, delimiter, pattern)) = split_engine(word) else {
            let glob = compile_glob(word)?;
            return Ok(self.filter_ids(|id| glob.is_match(id)));
        };

        match engine {
            'G' => self.match_documents(pattern, delimiter, LeafMode::Glob, |d| &d.grains),
            'P' => self.match_documents(pattern, delimiter, LeafMode::Pcre, |d| &d.grains),
            'I' => self.match_documents(pattern, delimiter, LeafMode::Glob, |d| &d.pillar),
            'J' => self.match_documents(pattern, delimiter, LeafMode::Pcre, |d| &d.pillar),
            'E' => {
                let re = compile_pcre(pattern)?;
                Ok(self.filter_ids(|id| re.is_match(id)))
            }
            'L' => {
                let mut found = BTreeSet::new();
                for id in pattern.split(',').filter(|s| !s.is_empty()) {
                    if self.engine.minions.contains_key(id) {
                        found.insert(id.to_string());
                    } else if self.negated == 0 {
                        self.missing.insert(id.to_string());
                    }
                }
                Ok(found)
            }
            'N' => {
                if self.depth >= MAX_NODEGROUP_DEPTH {
                    return Err(self.invalid("nodegroup nesting too deep"));
                }
                let expr = self
                    .engine
                    .nodegroups
                    .get(pattern)
                    .ok_or_else(|| TargetResolutionError::UnknownNodegroup(pattern.to_string()))?;
                self.engine
                    .evaluate_at_depth(expr, self.depth + 1, self.missing)
            }
            other => Err(self.invalid(format!("unsupported target engine {other:?}"))),
        }
    }

    fn match_documents(
        &self,
        pattern: &str,
        delimiter: char,
        mode: LeafMode,
        doc: impl Fn(&MinionData) -> &serde_json::Value,
    ) -> Result<BTreeSet<MinionId>, TargetResolutionError> {
        let mut found = BTreeSet::new();
        for (id, data) in self.engine.minions {
            if match_data(doc(data), pattern, delimiter, mode)? {
                found.insert(id.clone());
            }
        }
        Ok(found)
    }

    fn filter_ids(&self, pred: impl Fn(&str) -> bool) -> BTreeSet<MinionId> {
        self.engine
            .minions
            .keys()
            .filter(|id| pred(id))
            .cloned()
            .collect()
    }
}

/// Splits `X@pattern` or `Xd@pattern` (custom delimiter `d`, grain and
/// pillar engines only) into its engine, delimiter and pattern.
fn split_engine(word: &str) -> Option<(char, char, &str)> {
    let mut chars = word.char_indices();
    let (_, engine) = chars.next()?;
    if !engine.is_ascii_uppercase() {
        return None;
    }
    let (i, second) = chars.next()?;
    if second == '@' {
        return Some((engine, DEFAULT_DELIMITER, &word[i + 1..]));
    }
    let (j, third) = chars.next()?;
    if third == '@' && matches!(engine, 'G' | 'P' | 'I' | 'J') {
        return Some((engine, second, &word[j + 1..]));
    }
    None
}
