//! Sentence-annotation treebank model on top of the `conllu` reader/writer
//!
//! Files hold one token per line with ten tab-separated fields
//! (id, form, lemma, upos, xpos, feats, head, deprel, deps, misc). Sentences are
//! separated by blank lines and may be preceded by `#` comment lines. Word
//! identifiers are integers; multi-word tokens carry a range (`3-4`) and empty
//! nodes a decimal (`5.1`).
//!
//! Word lines are parsed and written through the `conllu` dependency graph.
//! The graph only models syntactic words, so range and empty-node lines are
//! kept alongside it in file order and written back unchanged. Enhanced
//! dependencies are not carried and are written as `_`.

pub mod locate;

use std::fmt;
use std::fs;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use conllu::graph::{DepTriple, Node, Sentence as DepSentence};
use conllu::io::{ReadSentence, Reader, WriteSentence, Writer};
use conllu::token::Token as UdToken;

use crate::error::{Error, Result};

pub use locate::{LanguageTreebankMapping, SplitFiles, TreebankLayout};

/// Number of tab-separated fields on a token line
const FIELD_COUNT: usize = 10;

/// Placeholder of an empty field
const EMPTY: &str = "_";

/// Token identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenId {
    /// Syntactic word, 1-based
    Word(usize),
    /// Multi-word token covering words `start..=end`
    Range(usize, usize),
    /// Empty node `major.minor`
    Empty(usize, usize),
}

impl TokenId {
    /// Whether this identifier addresses a syntactic word
    pub fn is_word(&self) -> bool {
        matches!(self, TokenId::Word(_))
    }
}

impl FromStr for TokenId {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let parse = |part: &str| {
            part.parse::<usize>()
                .map_err(|_| format!("invalid token id '{}'", s))
        };
        if let Some((start, end)) = s.split_once('-') {
            Ok(TokenId::Range(parse(start)?, parse(end)?))
        } else if let Some((major, minor)) = s.split_once('.') {
            Ok(TokenId::Empty(parse(major)?, parse(minor)?))
        } else {
            Ok(TokenId::Word(parse(s)?))
        }
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenId::Word(id) => write!(f, "{}", id),
            TokenId::Range(start, end) => write!(f, "{}-{}", start, end),
            TokenId::Empty(major, minor) => write!(f, "{}.{}", major, minor),
        }
    }
}

/// One token line
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    /// Identifier
    pub id: TokenId,
    /// Surface form
    pub form: String,
    /// Lemma
    pub lemma: String,
    /// Universal part-of-speech tag
    pub upos: String,
    /// Language-specific part-of-speech tag
    pub xpos: String,
    /// Morphological features, `_` when empty
    pub feats: String,
    /// Head position, `None` when written as `_`
    pub head: Option<usize>,
    /// Dependency relation
    pub deprel: String,
    /// Miscellaneous annotations
    pub misc: String,
}

impl Token {
    /// Feature name/value pairs; empty for `_`
    pub fn feature_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        pairs(&self.feats).filter_map(|feat| feat.split_once('='))
    }

    /// Range or empty-node line, which the dependency graph does not model
    fn parse_passthrough(fields: &[&str], id: TokenId, line_no: usize) -> Result<Self> {
        Ok(Self {
            id,
            form: fields[1].to_string(),
            lemma: fields[2].to_string(),
            upos: fields[3].to_string(),
            xpos: fields[4].to_string(),
            feats: fields[5].to_string(),
            head: parse_head(fields[6], line_no)?,
            deprel: fields[7].to_string(),
            misc: fields[9].to_string(),
        })
    }

    fn passthrough_line(&self) -> String {
        let head = self.head.map_or_else(|| EMPTY.to_string(), |head| head.to_string());
        [
            self.id.to_string(),
            self.form.clone(),
            self.lemma.clone(),
            self.upos.clone(),
            self.xpos.clone(),
            self.feats.clone(),
            head,
            self.deprel.clone(),
            EMPTY.to_string(),
            self.misc.clone(),
        ]
        .join("\t")
    }

    /// Word at graph position `position` of `graph`
    fn from_graph(graph: &DepSentence, position: usize, token: &UdToken) -> Self {
        let (head, deprel) = match graph.dep_graph().head(position) {
            Some(triple) => (
                Some(triple.head()),
                triple
                    .relation()
                    .map(|relation| relation.to_string())
                    .unwrap_or_else(|| EMPTY.to_string()),
            ),
            None => (None, EMPTY.to_string()),
        };
        let feats: Vec<String> = token
            .features()
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect();
        let misc: Vec<String> = token
            .misc()
            .iter()
            .map(|(key, value)| match value {
                Some(value) => format!("{}={}", key, value),
                None => key.to_string(),
            })
            .collect();

        Self {
            id: TokenId::Word(position),
            form: token.form().to_string(),
            lemma: or_empty(token.lemma()),
            upos: or_empty(token.upos()),
            xpos: or_empty(token.xpos()),
            feats: join_or_empty(feats),
            head,
            deprel,
            misc: join_or_empty(misc),
        }
    }

    fn to_graph_token(&self) -> UdToken {
        let mut token = UdToken::new(self.form.clone());
        token.set_lemma(field(&self.lemma));
        token.set_upos(field(&self.upos));
        token.set_xpos(field(&self.xpos));
        for (name, value) in self.feature_pairs() {
            token.features_mut().insert(name.to_string(), value.to_string());
        }
        for entry in pairs(&self.misc) {
            let (key, value) = match entry.split_once('=') {
                Some((key, value)) => (key, Some(value.to_string())),
                None => (entry, None),
            };
            token.misc_mut().insert(key.to_string(), value);
        }
        token
    }
}

fn pairs(field: &str) -> impl Iterator<Item = &str> {
    field
        .split('|')
        .filter(|entry| !entry.is_empty() && *entry != EMPTY)
}

fn field(value: &str) -> Option<String> {
    (value != EMPTY).then(|| value.to_string())
}

fn or_empty(value: Option<&str>) -> String {
    value.unwrap_or(EMPTY).to_string()
}

fn join_or_empty(entries: Vec<String>) -> String {
    if entries.is_empty() {
        EMPTY.to_string()
    } else {
        entries.join("|")
    }
}

fn parse_head(value: &str, line_no: usize) -> Result<Option<usize>> {
    match value {
        EMPTY => Ok(None),
        value => value
            .parse::<usize>()
            .map(Some)
            .map_err(|_| Error::treebank(line_no, format!("invalid head '{}'", value))),
    }
}

/// A sentence: comment lines followed by token lines in file order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sentence {
    /// Raw comment lines, including the leading `#`
    pub comments: Vec<String>,
    /// All token lines, multi-word ranges and empty nodes included
    pub tokens: Vec<Token>,
}

impl Sentence {
    /// Number of token lines, ranges and empty nodes included
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether the sentence has no token lines
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Syntactic words only, in order
    pub fn words(&self) -> impl Iterator<Item = &Token> {
        self.tokens.iter().filter(|token| token.id.is_word())
    }

    /// Number of syntactic words
    pub fn word_count(&self) -> usize {
        self.words().count()
    }

    /// Dependency graph of the words; heads address word positions
    pub fn to_graph(&self) -> Result<DepSentence> {
        let word_count = self.word_count();
        let mut graph = DepSentence::new();
        for word in self.words() {
            graph.push(word.to_graph_token());
        }
        for (position, word) in self.words().enumerate() {
            let Some(head) = word.head else { continue };
            if head > word_count {
                return Err(Error::treebank(
                    0,
                    format!("word {} has head {} outside of the sentence", position + 1, head),
                ));
            }
            graph
                .dep_graph_mut()
                .add_deprel(DepTriple::new(head, field(&word.deprel), position + 1));
        }
        Ok(graph)
    }

    /// Serialize in the line format, terminated by a blank line
    pub fn serialize(&self) -> Result<String> {
        let graph = self.to_graph()?;
        let mut buffer = Vec::new();
        {
            let mut writer = Writer::new(&mut buffer);
            writer
                .write_sentence(&graph)
                .map_err(|e| Error::treebank(0, e.to_string()))?;
        }
        let rendered = String::from_utf8(buffer).map_err(|e| Error::treebank(0, e.to_string()))?;
        let mut word_lines = rendered
            .lines()
            .filter(|line| !line.trim().is_empty() && !line.starts_with('#'));

        let mut out = String::new();
        for comment in &self.comments {
            out.push_str(comment);
            out.push('\n');
        }
        for token in &self.tokens {
            if token.id.is_word() {
                let line = word_lines
                    .next()
                    .ok_or_else(|| Error::treebank(0, "writer dropped a word line"))?;
                out.push_str(line);
            } else {
                out.push_str(&token.passthrough_line());
            }
            out.push('\n');
        }
        out.push('\n');
        Ok(out)
    }
}

/// Lines of one sentence collected until its terminating blank line
#[derive(Debug, Default)]
struct Block {
    /// Line number of the first line
    start: usize,
    comments: Vec<String>,
    /// File-order slots; `None` is a word line handed to the graph reader
    slots: Vec<Option<Token>>,
    word_lines: String,
    /// Line number and head of every word line
    heads: Vec<(usize, Option<usize>)>,
}

impl Block {
    fn is_empty(&self) -> bool {
        self.slots.is_empty() && self.comments.is_empty()
    }

    fn push_comment(&mut self, line: &str, line_no: usize) -> Result<()> {
        if !self.slots.is_empty() {
            return Err(Error::treebank(line_no, "comment inside token block"));
        }
        self.mark_start(line_no);
        self.comments.push(line.to_string());
        Ok(())
    }

    fn push_token(&mut self, line: &str, line_no: usize) -> Result<()> {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != FIELD_COUNT {
            return Err(Error::treebank(
                line_no,
                format!("expected {} fields, found {}", FIELD_COUNT, fields.len()),
            ));
        }
        self.mark_start(line_no);

        let id = fields[0]
            .parse::<TokenId>()
            .map_err(|reason| Error::treebank(line_no, reason))?;
        if id.is_word() {
            self.heads.push((line_no, parse_head(fields[6], line_no)?));
            self.word_lines.push_str(line);
            self.word_lines.push('\n');
            self.slots.push(None);
        } else {
            self.slots.push(Some(Token::parse_passthrough(&fields, id, line_no)?));
        }
        Ok(())
    }

    fn mark_start(&mut self, line_no: usize) {
        if self.is_empty() {
            self.start = line_no;
        }
    }

    fn finish(self) -> Result<Sentence> {
        if self.slots.is_empty() {
            return Err(Error::treebank(self.start, "comment block without tokens"));
        }
        let word_count = self.heads.len();
        if word_count == 0 {
            return Err(Error::treebank(self.start, "sentence without words"));
        }
        for &(line_no, head) in &self.heads {
            if head.is_some_and(|head| head > word_count) {
                return Err(Error::treebank(line_no, "head points outside of the sentence"));
            }
        }

        let graph = Reader::new(self.word_lines.as_bytes())
            .read_sentence()
            .map_err(|e| Error::treebank(self.start, e.to_string()))?
            .ok_or_else(|| Error::treebank(self.start, "sentence without words"))?;
        let mut words = graph
            .iter()
            .filter_map(Node::token)
            .enumerate()
            .map(|(index, token)| Token::from_graph(&graph, index + 1, token));

        let mut tokens = Vec::with_capacity(self.slots.len());
        for slot in self.slots {
            match slot {
                Some(token) => tokens.push(token),
                None => tokens.push(
                    words
                        .next()
                        .ok_or_else(|| Error::treebank(self.start, "reader dropped a word line"))?,
                ),
            }
        }
        Ok(Sentence {
            comments: self.comments,
            tokens,
        })
    }
}

/// A parsed treebank file
#[derive(Debug, Clone, Default)]
pub struct Treebank {
    /// File the treebank was read from, if any
    pub path: Option<PathBuf>,
    /// Sentences in file order
    pub sentences: Vec<Sentence>,
}

impl Treebank {
    /// Read a treebank file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = fs::File::open(path)?;
        let mut treebank = Self::from_reader(BufReader::new(file))?;
        treebank.path = Some(path.to_path_buf());
        Ok(treebank)
    }

    /// Parse a treebank from any buffered reader
    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self> {
        let mut sentences = Vec::new();
        let mut block = Block::default();

        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim_end_matches('\r');
            let line_no = index + 1;

            if line.trim().is_empty() {
                if !block.is_empty() {
                    sentences.push(std::mem::take(&mut block).finish()?);
                }
            } else if line.starts_with('#') {
                block.push_comment(line, line_no)?;
            } else {
                block.push_token(line, line_no)?;
            }
        }

        if !block.is_empty() {
            sentences.push(block.finish()?);
        }

        Ok(Self {
            path: None,
            sentences,
        })
    }

    /// Parse a treebank held in memory
    pub fn parse_str(content: &str) -> Result<Self> {
        Self::from_reader(content.as_bytes())
    }

    /// Number of sentences
    pub fn len(&self) -> usize {
        self.sentences.len()
    }

    /// Whether the treebank has no sentences
    pub fn is_empty(&self) -> bool {
        self.sentences.is_empty()
    }

    /// Total token lines over all sentences
    pub fn token_count(&self) -> usize {
        self.sentences.iter().map(Sentence::len).sum()
    }

    /// Write all sentences to `path`
    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<()> {
        write_sentences(path, &self.sentences)
    }
}

/// Write sentences to a file in the line format
pub fn write_sentences(path: impl AsRef<Path>, sentences: &[Sentence]) -> Result<()> {
    let file = fs::File::create(path)?;
    let mut writer = BufWriter::new(file);
    for sentence in sentences {
        writer.write_all(sentence.serialize()?.as_bytes())?;
    }
    writer.flush()?;
    Ok(())
}
