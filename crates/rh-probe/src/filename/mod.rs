//! Title, year, season and episode guessed from a media file's path.
//!
//! Container tags are the better source; [`enrich`] only fills what the
//! extractor left empty. The file name is read first, then its directories
//! for what it lacks: a `Season 2` or `S02` parent gives the season, the
//! folder above it names the show, and a movie folder carrying a year in
//! brackets (`Heat (1995)`) names the movie.

mod tokenizer;

use std::path::Path;

use chrono::Datelike;
use rh_core::MediaMetadata;

pub use tokenizer::{tokenize, SpannedToken, Token};

/// Directory names that group media without naming it.
const GENERIC_DIRS: &[&str] = &["tv", "shows", "series", "television", "movies", "films"];

const EARLIEST_YEAR: u32 = 1800;

/// What a name says about the media it holds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedName {
    pub title: Option<String>,
    pub year: Option<u32>,
    pub season: Option<u32>,
    pub episode: Option<u32>,
}

impl ParsedName {
    pub fn is_episode(&self) -> bool {
        self.season.is_some() || self.episode.is_some()
    }
}

/// Fill the fields `meta` lacks from what `path` says.
pub fn enrich(meta: &mut MediaMetadata, path: &Path) {
    let parsed = parse_path(path);
    if meta.title.is_none() {
        meta.title = parsed.title;
    }
    meta.year = meta.year.or(parsed.year);
    meta.season = meta.season.or(parsed.season);
    meta.episode = meta.episode.or(parsed.episode);
}

/// Parse a file path, consulting its parent and grandparent directories.
pub fn parse_path(path: &Path) -> ParsedName {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
    let parent = dir_name(path.parent());
    let grandparent = dir_name(path.parent().and_then(Path::parent));

    let mut parsed = parse_name(stem);

    let season_dir = parent.and_then(season_dir_number);
    if parsed.season.is_none() {
        if let Some(season) = season_dir {
            parsed.season = Some(season);
            if parsed.episode.is_none() {
                parsed.episode = trailing_episode(&tokenize(stem));
            }
            // "03.mkv" in a season folder is an episode number, not a title.
            if parsed.episode.is_some() && parsed.title.as_deref().is_some_and(is_numeric_title) {
                parsed.title = None;
            }
        }
    }

    if parsed.is_episode() {
        if parsed.title.is_none() {
            let show = if season_dir.is_some() { grandparent } else { parent };
            parsed.title = show
                .filter(|name| !is_generic_dir(name))
                .and_then(|name| parse_name(name).title);
        }
    } else if let Some(dir) = parent.filter(|name| has_bracketed_year(name)) {
        let folder = parse_name(dir);
        if folder.title.is_some() {
            parsed.title = folder.title;
        }
        parsed.year = folder.year.or(parsed.year);
    }

    if parsed.year.is_none() {
        parsed.year = [parent, grandparent]
            .into_iter()
            .flatten()
            .filter(|name| !is_generic_dir(name))
            .find_map(|name| parse_name(name).year);
    }
    parsed
}

/// Parse one file or directory name, without extension.
pub fn parse_name(name: &str) -> ParsedName {
    let tokens = tokenize(name);
    let mut parsed = ParsedName::default();
    let title_end = extract_title(&tokens, &mut parsed);
    extract_metadata(&tokens, title_end, &mut parsed);
    parsed
}

// -------------------------------------------------------------------------
// Title
// -------------------------------------------------------------------------

/// Collect the words before the first tag or marker. Returns the index of the
/// token that ended the title.
fn extract_title(tokens: &[SpannedToken<'_>], parsed: &mut ParsedName) -> usize {
    let mut words: Vec<&str> = Vec::new();
    let mut end = tokens.len();

    for (i, st) in tokens.iter().enumerate() {
        match &st.token {
            Token::Word(w) if is_marker_word(w) => {
                end = i;
                break;
            }
            Token::Word(w) | Token::Number(w) => words.push(w),
            // A leading year is part of the title ("2001 A Space Odyssey").
            Token::Year(y) if words.is_empty() => words.push(y),
            Token::Bracketed(_) if words.is_empty() => {}
            t if t.is_separator() => {}
            _ => {
                end = i;
                break;
            }
        }
    }

    parsed.title = title_case(&words);
    end
}

fn title_case(words: &[&str]) -> Option<String> {
    if words.is_empty() {
        return None;
    }
    let cased: Vec<String> = words
        .iter()
        .map(|w| {
            if w.chars().any(char::is_uppercase) {
                return w.to_string();
            }
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect();
    Some(cased.join(" "))
}

fn is_numeric_title(title: &str) -> bool {
    title.chars().all(|c| c.is_ascii_digit() || c == ' ')
}

// -------------------------------------------------------------------------
// Year, season, episode
// -------------------------------------------------------------------------

fn extract_metadata(tokens: &[SpannedToken<'_>], title_end: usize, parsed: &mut ParsedName) {
    let mut years = Vec::new();

    for (i, st) in tokens.iter().enumerate() {
        match &st.token {
            Token::SeasonEpisode(text) => {
                if parsed.season.is_none() {
                    parse_season_episode(text, parsed);
                }
            }
            Token::CrossEpisode(text) => {
                if parsed.season.is_none() {
                    if let Some((s, e)) = text.to_ascii_lowercase().split_once('x') {
                        parsed.season = s.parse().ok();
                        parsed.episode = e.parse().ok();
                    }
                }
            }
            Token::Year(text) if i >= title_end => years.extend(valid_year(text)),
            Token::Bracketed(text) => {
                let inner = text[1..text.len() - 1].trim();
                if inner.len() == 4 {
                    years.extend(valid_year(inner));
                }
            }
            Token::Word(w) => {
                if let Some(n) = marker_number(w, "season") {
                    set_if_none(&mut parsed.season, n.or_else(|| next_number(tokens, i)));
                } else if let Some(n) = marker_number(w, "episode") {
                    set_if_none(&mut parsed.episode, n.or_else(|| next_number(tokens, i)));
                } else if let Some(n) = episode_word_number(w) {
                    set_if_none(&mut parsed.episode, Some(n));
                }
            }
            _ => {}
        }
    }

    // The last year wins: "2001.A.Space.Odyssey.1968".
    parsed.year = years.last().copied();
}

/// Parse "S01E02" or "S01E02E03"; only the first episode is kept.
fn parse_season_episode(text: &str, parsed: &mut ParsedName) {
    let upper = text.to_ascii_uppercase();
    let after_s = &upper[1..];
    if let Some((season, episodes)) = after_s.split_once('E') {
        parsed.season = season.parse().ok();
        parsed.episode = episodes.split('E').next().and_then(|e| e.parse().ok());
    }
}

fn valid_year(text: &str) -> Option<u32> {
    let year: u32 = text.parse().ok()?;
    let current = chrono::Utc::now().year() as u32;
    (EARLIEST_YEAR..=current).contains(&year).then_some(year)
}

fn set_if_none(field: &mut Option<u32>, value: Option<u32>) {
    if field.is_none() {
        *field = value;
    }
}

/// `Some(None)` for a bare marker ("Season"), `Some(Some(n))` for one with
/// digits attached ("Season2"), `None` for any other word.
fn marker_number(word: &str, marker: &str) -> Option<Option<u32>> {
    let lower = word.to_lowercase();
    let rest = lower.strip_prefix(marker)?;
    if rest.is_empty() {
        Some(None)
    } else if rest.chars().all(|c| c.is_ascii_digit()) {
        Some(rest.parse().ok())
    } else {
        None
    }
}

/// "E05", "Ep05", "ep5".
fn episode_word_number(word: &str) -> Option<u32> {
    let lower = word.to_lowercase();
    let digits = lower
        .strip_prefix("ep")
        .or_else(|| lower.strip_prefix('e'))?;
    if digits.is_empty() || digits.len() > 3 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

fn is_marker_word(word: &str) -> bool {
    marker_number(word, "season").is_some()
        || marker_number(word, "episode").is_some()
        || episode_word_number(word).is_some()
}

/// The number following token `i`, skipping separators.
fn next_number(tokens: &[SpannedToken<'_>], i: usize) -> Option<u32> {
    tokens[i + 1..]
        .iter()
        .find(|st| !st.token.is_separator())
        .and_then(|st| match &st.token {
            Token::Number(n) | Token::Year(n) => n.parse().ok(),
            _ => None,
        })
}

/// The episode number closing a name inside a season folder: "03", "E03".
fn trailing_episode(tokens: &[SpannedToken<'_>]) -> Option<u32> {
    let last = tokens.iter().rev().find(|st| !st.token.is_separator())?;
    match &last.token {
        Token::Number(n) if n.len() <= 3 => n.parse().ok(),
        Token::Word(w) => episode_word_number(w),
        _ => None,
    }
}

// -------------------------------------------------------------------------
// Directories
// -------------------------------------------------------------------------

fn dir_name(dir: Option<&Path>) -> Option<&str> {
    dir?.file_name()?.to_str()
}

/// The season a directory stands for: "Season 2", "season.02", "S02".
fn season_dir_number(name: &str) -> Option<u32> {
    let lower = name.trim().to_lowercase();
    if let Some(rest) = lower.strip_prefix("season") {
        let digits = rest.trim_start_matches([' ', '.', '_', '-']);
        if !digits.is_empty() && digits.len() <= 2 && digits.chars().all(|c| c.is_ascii_digit()) {
            return digits.parse().ok();
        }
        return None;
    }
    let digits = lower.strip_prefix('s')?;
    if !digits.is_empty() && digits.len() <= 2 && digits.chars().all(|c| c.is_ascii_digit()) {
        return digits.parse().ok();
    }
    None
}

fn is_generic_dir(name: &str) -> bool {
    GENERIC_DIRS.iter().any(|g| g.eq_ignore_ascii_case(name))
}

fn has_bracketed_year(name: &str) -> bool {
    tokenize(name).iter().any(|st| match &st.token {
        Token::Bracketed(text) => {
            let inner = text[1..text.len() - 1].trim();
            inner.len() == 4 && valid_year(inner).is_some()
        }
        _ => false,
    })
}
