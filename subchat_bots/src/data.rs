use std::{
    collections::HashMap,
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};

use anyhow::{anyhow, Context, Result};
use plane::ml::{
    nn::{embedding::EmbeddingLayer, linear::Linear},
    NodeValue, RngStrategy, RNG,
};
use tracing::{info, instrument};

use crate::subtitles::Dialogue;

pub const UNKNOWN_TOKEN: &str = "#UNK";
pub const BEGIN_TOKEN: &str = "#BEG";
pub const END_TOKEN: &str = "#END";

const SPECIAL_TOKEN_SCALE: NodeValue = 0.1;

/// Pretrained word vectors, with the special tokens appended after the file rows.
#[derive(Debug, Clone)]
pub struct Embeddings {
    words: HashMap<String, usize>,
    layer: EmbeddingLayer,
    vocab: Vec<String>,
    special_offset: usize,
}

impl Embeddings {
    pub fn len(&self) -> usize {
        self.vocab.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vocab.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.layer.embedding_dimension()
    }

    pub fn index(&self, word: &str) -> Option<usize> {
        self.words.get(word).copied()
    }

    pub fn word(&self, index: usize) -> Option<&str> {
        self.vocab.get(index).map(|x| x.as_str())
    }

    pub fn unknown_index(&self) -> usize {
        self.special_offset
    }

    pub fn begin_index(&self) -> usize {
        self.special_offset + 1
    }

    pub fn end_index(&self) -> usize {
        self.special_offset + 2
    }

    pub fn weights(&self) -> &Linear {
        self.layer.table()
    }

    pub fn layer(&self) -> &EmbeddingLayer {
        &self.layer
    }
}

/// A single training sample, `#BEG w1 .. wn #END` on both sides.
#[derive(Debug, Clone, PartialEq)]
pub struct PhrasePair {
    pub input: Vec<usize>,
    pub output: Vec<usize>,
}

#[instrument(level = "info", skip_all)]
pub fn read_embeddings<P: AsRef<Path>>(
    path: P,
    limit: Option<usize>,
    rng: &RngStrategy,
) -> Result<Embeddings> {
    let path = path.as_ref();
    let file = File::open(path)
        .with_context(|| format!("failed to open embeddings file: {}", path.display()))?;

    let embeddings = read_embeddings_from(BufReader::new(file), limit, rng)
        .with_context(|| format!("failed to read embeddings from {}", path.display()))?;

    info!(
        "Loaded {} embeddings of dimension {}",
        embeddings.len(),
        embeddings.dimension()
    );
    Ok(embeddings)
}

/// Reads `word v1 v2 .. vd` rows, stopping after `limit` rows when given.
pub fn read_embeddings_from<R: BufRead>(
    reader: R,
    limit: Option<usize>,
    rng: &RngStrategy,
) -> Result<Embeddings> {
    let mut words = HashMap::new();
    let mut vocab = vec![];
    let mut values: Vec<NodeValue> = vec![];
    let mut dimension = None;

    for (line_idx, line) in reader.lines().enumerate() {
        if limit.map_or(false, |limit| vocab.len() >= limit) {
            break;
        }
        let line = line.with_context(|| format!("failed to read line {}", line_idx + 1))?;
        let mut parts = line.split_whitespace();
        let Some(word) = parts.next() else {
            continue;
        };

        let row = parts
            .map(|x| {
                x.parse::<NodeValue>()
                    .with_context(|| format!("invalid value '{x}' on line {}", line_idx + 1))
            })
            .collect::<Result<Vec<_>>>()?;

        let expected = *dimension.get_or_insert(row.len());
        if row.is_empty() || row.len() != expected {
            return Err(anyhow!(
                "invalid embedding dimension on line {}: expected={expected}, actual={}",
                line_idx + 1,
                row.len()
            ));
        }

        words.insert(word.to_string(), vocab.len());
        vocab.push(word.to_string());
        values.extend(row);
    }

    let dimension = dimension.context("embedding table is empty")?;
    let special_offset = vocab.len();

    for token in [UNKNOWN_TOKEN, BEGIN_TOKEN, END_TOKEN] {
        words.insert(token.to_string(), vocab.len());
        vocab.push(token.to_string());
        if token == UNKNOWN_TOKEN {
            values.extend((0..dimension).map(|_| 0.0));
        } else {
            let random_row = (0..dimension).map(|_| (rng.rand() * 2.0 - 1.0) * SPECIAL_TOKEN_SCALE);
            values.extend(random_row);
        }
    }

    let table = Linear::from_iter(dimension, values.into_iter())?;
    Ok(Embeddings {
        words,
        layer: EmbeddingLayer::from_pretrained(table),
        vocab,
        special_offset,
    })
}

pub fn encode_words<S: AsRef<str>>(words: &[S], embeddings: &Embeddings) -> Vec<usize> {
    let unknown = embeddings.unknown_index();
    let tokens = words.iter().map(|word| {
        embeddings
            .index(&word.as_ref().to_lowercase())
            .unwrap_or(unknown)
    });

    [embeddings.begin_index()]
        .into_iter()
        .chain(tokens)
        .chain([embeddings.end_index()])
        .collect()
}

pub fn decode_words<'a>(indices: &[usize], embeddings: &'a Embeddings) -> Vec<&'a str> {
    indices
        .iter()
        .map(|&idx| embeddings.word(idx).unwrap_or(UNKNOWN_TOKEN))
        .collect()
}

/// Pairs every phrase with the one following it in the same dialogue.
pub fn dialogues_to_train(dialogues: &[Dialogue], embeddings: &Embeddings) -> Vec<PhrasePair> {
    dialogues
        .iter()
        .flat_map(|dialogue| dialogue.windows(2))
        .map(|pair| PhrasePair {
            input: encode_words(&pair[0].words, embeddings),
            output: encode_words(&pair[1].words, embeddings),
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io::Cursor;

    use test_log::test;

    use crate::subtitles::Phrase;

    use super::*;

    pub const TABLE: &str = "the 0.1 0.2 0.3\n\
                             cat -0.5 0.25 1.0\n\
                             sat 0.0 0.5 -0.25\n\
                             on 0.75 -0.1 0.2\n\
                             mat 0.3 0.3 0.3\n";

    pub fn test_embeddings() -> Embeddings {
        let rng = RngStrategy::testable(42);
        read_embeddings_from(Cursor::new(TABLE), None, &rng).unwrap()
    }

    pub fn dialogue(phrases: &[&str]) -> Dialogue {
        phrases
            .iter()
            .map(|x| Phrase {
                words: x.split_whitespace().map(String::from).collect(),
                ..Default::default()
            })
            .collect()
    }

    #[test]
    fn read_embeddings_appends_special_tokens() {
        let embeddings = test_embeddings();

        assert_eq!(embeddings.len(), 8);
        assert_eq!(embeddings.dimension(), 3);
        assert_eq!(embeddings.weights().count(), 8);
        assert_eq!(embeddings.index("cat"), Some(1));
        assert_eq!(embeddings.word(embeddings.begin_index()), Some(BEGIN_TOKEN));
        assert_eq!(embeddings.index(END_TOKEN), Some(embeddings.end_index()));

        let unknown = embeddings.weights().rows(embeddings.unknown_index(), 1).unwrap();
        assert_eq!(unknown.to_sum(), 0.0);
        let begin = embeddings.weights().rows(embeddings.begin_index(), 1).unwrap();
        assert!(begin.iter().abs().collect().to_sum() > 0.0);
        assert!(begin.values().iter().all(|x| x.abs() <= SPECIAL_TOKEN_SCALE));
    }

    #[test]
    fn read_embeddings_honours_limit() {
        let rng = RngStrategy::testable(42);
        let embeddings = read_embeddings_from(Cursor::new(TABLE), Some(2), &rng).unwrap();

        assert_eq!(embeddings.len(), 5);
        assert_eq!(embeddings.index("sat"), None);
        assert_eq!(embeddings.unknown_index(), 2);
    }

    #[test]
    fn read_embeddings_later_duplicate_wins() {
        let rng = RngStrategy::testable(42);
        let table = "a 1.0 2.0\nb 3.0 4.0\na 5.0 6.0\n";
        let embeddings = read_embeddings_from(Cursor::new(table), None, &rng).unwrap();

        assert_eq!(embeddings.index("a"), Some(2));
        assert_eq!(embeddings.len(), 6);
    }

    #[test]
    fn read_embeddings_rejects_bad_rows() {
        let rng = RngStrategy::testable(42);

        let mismatched = "a 1.0 2.0\nb 3.0\n";
        assert!(read_embeddings_from(Cursor::new(mismatched), None, &rng).is_err());

        let unparsable = "a 1.0 two\n";
        assert!(read_embeddings_from(Cursor::new(unparsable), None, &rng).is_err());

        assert!(read_embeddings_from(Cursor::new(""), None, &rng).is_err());
    }

    #[test]
    fn encode_words_maps_unknown_words() {
        let embeddings = test_embeddings();
        let encoded = encode_words(&["The", "dog", "sat"], &embeddings);

        assert_eq!(
            encoded,
            vec![
                embeddings.begin_index(),
                0,
                embeddings.unknown_index(),
                2,
                embeddings.end_index()
            ]
        );
        assert_eq!(
            decode_words(&encoded, &embeddings),
            vec!["#BEG", "the", "#UNK", "sat", "#END"]
        );
    }

    #[test]
    fn dialogues_to_train_pairs_adjacent_phrases() {
        let embeddings = test_embeddings();
        let dialogues = vec![
            dialogue(&["the cat", "sat on", "the mat"]),
            dialogue(&["alone"]),
            dialogue(&["cat", "dog"]),
        ];

        let samples = dialogues_to_train(&dialogues, &embeddings);

        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0].input, encode_words(&["the", "cat"], &embeddings));
        assert_eq!(samples[0].output, samples[1].input);
        assert!(samples
            .iter()
            .flat_map(|x| x.input.iter().chain(&x.output))
            .all(|&idx| idx < embeddings.len()));
    }
}
