//! Logos tokenizer for media file and directory names.
//!
//! Keyword patterns are case-insensitive. Quality, codec and edition tags
//! are grouped by kind since the parser only needs to know where the title
//! ends.

use logos::Logos;

/// Tokens of a file or directory name.
///
/// Each keyword kind has its own priority so it beats [`Token::Word`] on an
/// equal-length match; the longest match wins otherwise.
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t]+")]
pub enum Token<'src> {
    /// Bracketed text: `[Group]`, `(1999)`, `{tmdb-603}`.
    #[regex(r"\[[^\]]*\]|\([^)]*\)|\{[^}]*\}", priority = 15)]
    Bracketed(&'src str),

    /// Season and episode tag: S01E02, S01E02E03.
    #[regex(r"(?i)S\d{1,2}E\d{1,3}(E\d{1,3})*", priority = 14)]
    SeasonEpisode(&'src str),

    /// Season and episode as 1x02.
    #[regex(r"\d{1,2}[xX]\d{1,3}", priority = 13)]
    CrossEpisode(&'src str),

    /// 480p, 1080i, 2160p, 4K.
    #[regex(r"(?i)(\d{3,4}[pi]|[48]k)", priority = 12)]
    Resolution(&'src str),

    #[regex(
        r"(?i)(Blu-?Ray|BRRip|BDRip|DVDRip|DVDScr|HDRip|WEB-?DL|WEB-?Rip|HDTV|Remux|UHD|FHD)",
        priority = 11
    )]
    Source(&'src str),

    #[regex(
        r"(?i)(x\.?26[45]|H\.?26[45]|HEVC|AVC|AV1|VP9|XviD|DivX|MPEG-?[24]|10-?bit)",
        priority = 10
    )]
    VideoCodec(&'src str),

    #[regex(
        r"(?i)(DTS-?HD(\.?MA)?|DTS|TrueHD|Atmos|E-?AC-?3|DDP|DD\+|AC-?3|AAC(2\.0)?|FLAC|OPUS|DD5\.1)",
        priority = 9
    )]
    AudioCodec(&'src str),

    #[regex(r"(?i)(HDR10\+?|HDR|SDR|HLG|DoVi|Dolby\.?Vision)", priority = 8)]
    Hdr(&'src str),

    #[regex(
        r"(?i)(Directors?[.\s'-]*Cut|Extended|Unrated|Remastered|Theatrical|IMAX)",
        priority = 7
    )]
    Edition(&'src str),

    #[regex(r"(?i)(PROPER|REPACK)", priority = 6)]
    Revision(&'src str),

    /// Four digits that could be a year; range checked by the parser.
    #[regex(r"(18|19|20)\d{2}", priority = 5)]
    Year(&'src str),

    #[token(".")]
    Dot,

    #[token("-")]
    Hyphen,

    #[token("_")]
    Underscore,

    #[regex(r"\p{L}[\p{L}\p{N}']*", priority = 1)]
    Word(&'src str),

    #[regex(r"\d+", priority = 2)]
    Number(&'src str),
}

impl Token<'_> {
    pub fn is_separator(&self) -> bool {
        matches!(self, Token::Dot | Token::Hyphen | Token::Underscore)
    }
}

/// A token with the byte span it covers in the input.
#[derive(Debug, Clone)]
pub struct SpannedToken<'src> {
    pub token: Token<'src>,
    pub span: std::ops::Range<usize>,
}

/// Tokenize `input`, dropping characters no pattern covers.
pub fn tokenize(input: &str) -> Vec<SpannedToken<'_>> {
    Token::lexer(input)
        .spanned()
        .filter_map(|(result, span)| result.ok().map(|token| SpannedToken { token, span }))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<Token<'_>> {
        tokenize(input).into_iter().map(|t| t.token).collect()
    }

    #[test]
    fn release_name() {
        let tokens = kinds("The.Matrix.1999.1080p.BluRay.x264-GROUP");
        assert_eq!(tokens[0], Token::Word("The"));
        assert!(tokens.contains(&Token::Year("1999")));
        assert!(tokens.contains(&Token::Resolution("1080p")));
        assert!(tokens.contains(&Token::Source("BluRay")));
        assert!(tokens.contains(&Token::VideoCodec("x264")));
        assert_eq!(tokens.last(), Some(&Token::Word("GROUP")));
    }

    #[test]
    fn episode_forms() {
        assert!(kinds("show.s02e10").contains(&Token::SeasonEpisode("s02e10")));
        assert!(kinds("show 3x07").contains(&Token::CrossEpisode("3x07")));
    }

    #[test]
    fn longer_word_beats_keyword_prefix() {
        assert_eq!(kinds("Webster"), vec![Token::Word("Webster")]);
        assert_eq!(kinds("HDRip"), vec![Token::Source("HDRip")]);
    }

    #[test]
    fn brackets_and_unicode_words() {
        assert_eq!(
            kinds("Amélie (2001)"),
            vec![Token::Word("Amélie"), Token::Bracketed("(2001)")]
        );
    }

    #[test]
    fn spans_point_into_input() {
        let input = "Heat.1995";
        let tokens = tokenize(input);
        assert_eq!(&input[tokens[2].span.clone()], "1995");
    }
}
