use hashbrown::HashMap;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::graph::argmax;

/// Token ↔ index table with one-hot encoding.
///
/// Indices are handed out in interning order and never reused.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Vocabulary {
    dim: usize,
    tokens: Vec<String>,
    index: HashMap<String, usize>,
}

impl Vocabulary {
    /// `dim` is the length of every encoded vector (the graph layer width).
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            tokens: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn from_tokens<I, S>(dim: usize, tokens: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut vocab = Self::new(dim);
        for t in tokens {
            vocab.intern(t.as_ref())?;
        }
        Ok(vocab)
    }

    /// Index of `token`, assigning the next free one if it is new.
    pub fn intern(&mut self, token: &str) -> Result<usize> {
        if let Some(&i) = self.index.get(token) {
            return Ok(i);
        }
        if self.tokens.len() >= self.dim {
            return Err(Error::Configuration("vocabulary is full"));
        }
        let i = self.tokens.len();
        self.tokens.push(token.to_string());
        self.index.insert(token.to_string(), i);
        Ok(i)
    }

    pub fn index_of(&self, token: &str) -> Option<usize> {
        self.index.get(token).copied()
    }

    pub fn token(&self, index: usize) -> Option<&str> {
        self.tokens.get(index).map(String::as_str)
    }

    #[must_use]
    pub fn dim(&self) -> usize {
        self.dim
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// One-hot vector of length `dim`. Unknown tokens encode to all zeros.
    pub fn encode(&self, token: &str) -> Vec<f32> {
        let mut v = vec![0.0; self.dim];
        if let Some(i) = self.index_of(token) {
            v[i] = 1.0;
        }
        v
    }

    /// Token at the argmax of `values`, if that index has been interned.
    pub fn decode(&self, values: &[f32]) -> Option<&str> {
        self.token(argmax(values)?)
    }
}
