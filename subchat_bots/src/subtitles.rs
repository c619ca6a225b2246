use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use flate2::read::GzDecoder;
use quick_xml::{
    events::{BytesStart, Event},
    Reader,
};
use tracing::{debug, instrument};

/// One subtitle sentence, with the timestamps attached to it (if any).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Phrase {
    pub words: Vec<String>,
    pub time_start: Option<Duration>,
    pub time_stop: Option<Duration>,
}

pub type Dialogue = Vec<Phrase>;

#[instrument(level = "info", skip_all)]
pub fn read_file<P: AsRef<Path>>(path: P, dialog_seconds: u64) -> Result<Vec<Dialogue>> {
    let path = path.as_ref();
    let file = File::open(path)
        .with_context(|| format!("failed to open subtitles file: {}", path.display()))?;

    let is_gzip = path.extension().map_or(false, |ext| ext == "gz");
    let dialogues = if is_gzip {
        read_reader(BufReader::new(GzDecoder::new(file)), dialog_seconds)
    } else {
        read_reader(BufReader::new(file), dialog_seconds)
    };

    dialogues.with_context(|| format!("failed to read subtitles from {}", path.display()))
}

pub fn read_reader<R: BufRead>(reader: R, dialog_seconds: u64) -> Result<Vec<Dialogue>> {
    let phrases = parse_phrases(reader)?;
    debug!("Parsed {} phrases", phrases.len());
    Ok(split_phrases(phrases, dialog_seconds))
}

/// Reads every `<s>` sentence of an OpenSubtitles document as a [`Phrase`].
pub fn parse_phrases<R: BufRead>(reader: R) -> Result<Vec<Phrase>> {
    let mut reader = Reader::from_reader(reader);
    reader.trim_text(true);

    let mut phrases = vec![];
    let mut buf = vec![];
    let mut current: Option<Phrase> = None;
    let mut has_word_tags = false;
    let mut bare_text = String::new();
    let mut in_word = false;

    loop {
        let event = reader.read_event_into(&mut buf).with_context(|| {
            format!("malformed xml at position {}", reader.buffer_position())
        })?;

        match event {
            Event::Start(e) if e.name().as_ref() == b"s" => {
                current = Some(Phrase::default());
                has_word_tags = false;
                bare_text.clear();
            }
            Event::Start(e) if e.name().as_ref() == b"w" => {
                in_word = true;
                has_word_tags = true;
            }
            Event::Start(e) | Event::Empty(e) if e.name().as_ref() == b"time" => {
                if let Some(phrase) = current.as_mut() {
                    apply_time_tag(phrase, &e)?;
                }
            }
            Event::Text(text) => {
                if let Some(phrase) = current.as_mut() {
                    let text = text.unescape()?;
                    if in_word {
                        phrase.words.push(text.into_owned());
                    } else {
                        bare_text.push(' ');
                        bare_text.push_str(&text);
                    }
                }
            }
            Event::End(e) if e.name().as_ref() == b"w" => in_word = false,
            Event::End(e) if e.name().as_ref() == b"s" => {
                if let Some(mut phrase) = current.take() {
                    if !has_word_tags {
                        phrase.words = bare_text.split_whitespace().map(String::from).collect();
                    }
                    if !phrase.words.is_empty() {
                        phrases.push(phrase);
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(phrases)
}

fn apply_time_tag(phrase: &mut Phrase, tag: &BytesStart) -> Result<()> {
    let id = tag.try_get_attribute("id")?;
    let value = tag.try_get_attribute("value")?;
    let (Some(id), Some(value)) = (id, value) else {
        return Ok(());
    };

    let id = id.unescape_value()?;
    let time = parse_time(&value.unescape_value()?)?;
    if id.ends_with('S') {
        phrase.time_start.get_or_insert(time);
    } else if id.ends_with('E') {
        phrase.time_stop = Some(time);
    }
    Ok(())
}

/// Parses `HH:MM:SS,mmm` (a `.` before the millis is also accepted).
pub fn parse_time(value: &str) -> Result<Duration> {
    let invalid = || anyhow!("invalid timestamp: '{value}'");
    let (clock, millis) = value
        .split_once(|c| c == ',' || c == '.')
        .unwrap_or((value, "0"));

    let mut parts = clock.trim().split(':');
    let mut next_part = || -> Result<u64> {
        let part = parts.next().ok_or_else(invalid)?;
        part.trim().parse::<u64>().map_err(|_| invalid())
    };
    let (hours, minutes, seconds) = (next_part()?, next_part()?, next_part()?);
    if parts.next().is_some() || minutes >= 60 || seconds >= 60 {
        return Err(invalid());
    }
    let millis = millis.trim().parse::<u64>().map_err(|_| invalid())?;

    let seconds = hours * 3600 + minutes * 60 + seconds;
    Ok(Duration::from_secs(seconds) + Duration::from_millis(millis))
}

/// Groups phrases into dialogues, starting a new one after a silence longer
/// than `dialog_seconds`.
pub fn split_phrases(phrases: Vec<Phrase>, dialog_seconds: u64) -> Vec<Dialogue> {
    let threshold = Duration::from_secs(dialog_seconds);
    let mut dialogues = vec![];
    let mut dialogue: Dialogue = vec![];
    let mut prev_stop: Option<Duration> = None;

    for phrase in phrases {
        if let (Some(start), Some(stop)) = (phrase.time_start, prev_stop) {
            if start.saturating_sub(stop) > threshold && !dialogue.is_empty() {
                dialogues.push(std::mem::take(&mut dialogue));
            }
        }
        if phrase.time_stop.is_some() {
            prev_stop = phrase.time_stop;
        }
        dialogue.push(phrase);
    }

    if !dialogue.is_empty() {
        dialogues.push(dialogue);
    }
    dialogues
}
