//! Tagged checklist extraction for folders of Markdown notes.
//!
//! The library finds `- [ ]` checklist items attached to a tag (either a `#tag`
//! heading the block, or a front-matter tag covering the whole file), turns their
//! inline markup into a small display tree, groups and sorts them, and flips a
//! single item's checkbox back in its source file.
//!
//! Host integration lives behind the `storage` traits; `vault` provides the
//! filesystem implementation used by the CLI.

pub mod core {
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use std::{fmt, str::FromStr};

    /* ------------------------------- Tags ------------------------------- */

    /// Main/sub components of a `#main/sub` tag. Both are `None` for untagged items.
    #[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct TagMeta {
        pub main: Option<String>,
        pub sub: Option<String>,
    }

    impl TagMeta {
        pub fn untagged() -> Self {
            Self::default()
        }

        pub fn new(main: &str, sub: Option<&str>) -> Self {
            Self {
                main: Some(main.to_string()),
                sub: sub.map(str::to_string),
            }
        }

        pub fn is_tagged(&self) -> bool {
            self.main.is_some()
        }

        /// Grouping key: `#main/sub`, omitting missing parts.
        pub fn key(&self) -> String {
            let parts: Vec<&str> = [self.main.as_deref(), self.sub.as_deref()]
                .into_iter()
                .flatten()
                .collect();
            format!("#{}", parts.join("/"))
        }
    }

    /* ------------------------------- Links ------------------------------- */

    /// Resolved link target for a raw `[[target]]` written in a todo line.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct LinkMeta {
        pub target_path: String,
        pub display_name: String,
    }

    /// Raw link target (as written) → resolved link, for a single line.
    pub type LinkMap = IndexMap<String, LinkMeta>;

    /* ---------------------------- Markup trees ---------------------------- */

    /// Inline constructs recognised by the tokenizer besides plain text.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum ContainerKind {
        Bold,
        Italic,
        Link,
    }

    /// Intermediate tokenizer output. A `Link` container's `raw` is the bracket body.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum TokenChunk {
        Text(String),
        Container {
            kind: ContainerKind,
            raw: String,
            children: Vec<TokenChunk>,
        },
    }

    impl TokenChunk {
        pub fn text(s: &str) -> Self {
            Self::Text(s.to_string())
        }
    }

    /// Display tree handed to the presentation layer.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(tag = "type", rename_all = "lowercase")]
    pub enum DisplayChunk {
        Text {
            value: String,
        },
        Bold {
            children: Vec<DisplayChunk>,
        },
        Italic {
            children: Vec<DisplayChunk>,
        },
        Link {
            children: Vec<DisplayChunk>,
            target_path: String,
            label: String,
        },
    }

    impl DisplayChunk {
        pub fn text(s: &str) -> Self {
            Self::Text {
                value: s.to_string(),
            }
        }
    }

    /* ------------------------------ Documents ------------------------------ */

    /// Identity of a document as reported by the document store.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Document {
        /// Store-relative path using `/` separators, e.g. `projects/garden.md`.
        pub path: String,
        /// File name with extension.
        pub name: String,
        /// File name without the `.md` extension.
        pub label: String,
        /// Creation time, epoch milliseconds.
        pub created_ts: i64,
        /// Last modification time, epoch milliseconds.
        pub modified_ts: i64,
    }

    impl Document {
        pub fn new(path: &str, created_ts: i64, modified_ts: i64) -> Self {
            let name = path.rsplit('/').next().unwrap_or(path).to_string();
            let label = name.strip_suffix(".md").unwrap_or(&name).to_string();
            Self {
                path: path.to_string(),
                name,
                label,
                created_ts,
                modified_ts,
            }
        }
    }

    /// A `#tag` found in the document body.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TagOccurrence {
        /// Tag text including the leading `#`.
        pub tag: String,
        /// 0-based line number.
        pub line: usize,
    }

    /// A `[[target|alias]]` link found in the document body.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct LinkOccurrence {
        /// Target as written (text before the `|`).
        pub target: String,
        /// Alias if given, otherwise the target.
        pub display: String,
        pub line: usize,
    }

    /// Everything the metadata index knows about one document.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct DocumentMetadata {
        #[serde(default)]
        pub tags: Vec<TagOccurrence>,
        #[serde(default)]
        pub links: Vec<LinkOccurrence>,
        /// Front-matter tags normalised to `#tag`.
        #[serde(default)]
        pub frontmatter_tags: Vec<String>,
    }

    /* -------------------------------- Items -------------------------------- */

    /// One checklist line found by the scanner.
    #[serde_with::skip_serializing_none]
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TodoItem {
        pub checked: bool,
        pub display: Vec<DisplayChunk>,
        pub file_path: String,
        pub file_name: String,
        pub file_label: String,
        pub file_created_ts: i64,
        pub main_tag: Option<String>,
        pub sub_tag: Option<String>,
        /// 0-based line number in the source document.
        pub line: usize,
        pub indent_spaces: usize,
        /// Item text with the tag token removed; used for alphabetical sorting.
        pub original_text: String,
        /// Raw line content after the checkbox at scan time; checked again before toggling.
        pub source_text: String,
    }

    impl TodoItem {
        pub fn tag_meta(&self) -> TagMeta {
            TagMeta {
                main: self.main_tag.clone(),
                sub: self.sub_tag.clone(),
            }
        }
    }

    /* ------------------------------- Groups ------------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum GroupBy {
        #[default]
        Page,
        Tag,
    }

    impl GroupBy {
        pub fn other(self) -> Self {
            match self {
                GroupBy::Page => GroupBy::Tag,
                GroupBy::Tag => GroupBy::Page,
            }
        }
    }

    impl fmt::Display for GroupBy {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(match self {
                GroupBy::Page => "page",
                GroupBy::Tag => "tag",
            })
        }
    }

    impl FromStr for GroupBy {
        type Err = DomainError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            match s.trim().to_ascii_lowercase().as_str() {
                "page" => Ok(GroupBy::Page),
                "tag" => Ok(GroupBy::Tag),
                _ => Err(DomainError::UnknownGroupBy(s.to_string())),
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub enum SortDirection {
        #[default]
        #[serde(rename = "a->z")]
        AlphabeticAsc,
        #[serde(rename = "z->a")]
        AlphabeticDesc,
        #[serde(rename = "new->old")]
        NewestFirst,
        #[serde(rename = "old->new")]
        OldestFirst,
    }

    impl fmt::Display for SortDirection {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(match self {
                SortDirection::AlphabeticAsc => "a->z",
                SortDirection::AlphabeticDesc => "z->a",
                SortDirection::NewestFirst => "new->old",
                SortDirection::OldestFirst => "old->new",
            })
        }
    }

    impl FromStr for SortDirection {
        type Err = DomainError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            match s.trim() {
                "a->z" | "asc" => Ok(SortDirection::AlphabeticAsc),
                "z->a" | "desc" => Ok(SortDirection::AlphabeticDesc),
                "new->old" | "newest" => Ok(SortDirection::NewestFirst),
                "old->new" | "oldest" => Ok(SortDirection::OldestFirst),
                _ => Err(DomainError::UnknownSortDirection(s.to_string())),
            }
        }
    }

    /// A group of todos keyed by page path or tag.
    #[serde_with::skip_serializing_none]
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TodoGroup {
        pub id: String,
        pub kind: GroupBy,
        pub todos: Vec<TodoItem>,
        pub sort_name: String,
        pub display_name: String,
        pub oldest_item_ts: i64,
        pub newest_item_ts: i64,
        pub subgroups: Option<Vec<TodoGroup>>,
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, thiserror::Error)]
    pub enum DomainError {
        #[error("unknown sort direction {0:?} (expected a->z, z->a, new->old or old->new)")]
        UnknownSortDirection(String),
        #[error("unknown grouping {0:?} (expected page or tag)")]
        UnknownGroupBy(String),
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn tag_key_omits_missing_parts() {
            assert_eq!(TagMeta::new("work", Some("urgent")).key(), "#work/urgent");
            assert_eq!(TagMeta::new("home", None).key(), "#home");
            assert_eq!(TagMeta::untagged().key(), "#");
        }

        #[test]
        fn document_label_drops_md_extension() {
            let doc = Document::new("notes/Garden Plan.md", 1, 2);
            assert_eq!(doc.name, "Garden Plan.md");
            assert_eq!(doc.label, "Garden Plan");

            let other = Document::new("scratch.txt", 1, 2);
            assert_eq!(other.label, "scratch.txt");
        }

        #[test]
        fn sort_direction_round_trips_through_strings() {
            for dir in [
                SortDirection::AlphabeticAsc,
                SortDirection::AlphabeticDesc,
                SortDirection::NewestFirst,
                SortDirection::OldestFirst,
            ] {
                assert_eq!(dir.to_string().parse::<SortDirection>().unwrap(), dir);
            }
            assert!("sideways".parse::<SortDirection>().is_err());
            assert_eq!("Tag".parse::<GroupBy>().unwrap(), GroupBy::Tag);
        }

        #[test]
        fn display_chunks_serialize_with_type_tag() {
            let chunk = DisplayChunk::Bold {
                children: vec![DisplayChunk::text("hi")],
            };
            let json = serde_json::to_string(&chunk).unwrap();
            assert_eq!(
                json,
                r#"{"type":"bold","children":[{"type":"text","value":"hi"}]}"#
            );
        }
    }
}

pub mod tags {
    //! Tag parsing (`#main/sub`), tag filters, and stripping tag tokens from item text.

    use crate::core::TagMeta;
    use nom::{
        IResult,
        bytes::complete::take_till1,
        character::complete::char,
        combinator::{opt, rest},
        error::VerboseError,
        sequence::preceded,
    };

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /// Split `#main/sub` on the first `/`. Input without a leading `#` is untagged.
    pub fn resolve(tag: &str) -> TagMeta {
        match tag_parts(tag) {
            Ok((_, (main, sub))) => TagMeta {
                main: Some(main.to_string()),
                sub: sub.filter(|s| !s.is_empty()).map(str::to_string),
            },
            Err(_) => TagMeta::untagged(),
        }
    }

    fn tag_parts(i: &str) -> PResult<'_, (&str, Option<&str>)> {
        let (i, _) = char('#')(i)?;
        let (i, main) = take_till1(|c| c == '/')(i)?;
        let (i, sub) = opt(preceded(char('/'), rest))(i)?;
        Ok((i, (main, sub)))
    }

    /// Which tags select todo blocks.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum TagFilter {
        /// Wildcard: every document is scanned line by line.
        All,
        /// Lower-case main tag names without `#`.
        Only(Vec<String>),
    }

    impl TagFilter {
        /// An empty list or one containing `*` is the wildcard.
        pub fn from_names<S: AsRef<str>>(names: &[S]) -> Self {
            let cleaned: Vec<String> = names
                .iter()
                .map(|n| n.as_ref().trim().trim_start_matches('#').to_lowercase())
                .filter(|n| !n.is_empty())
                .collect();
            if cleaned.is_empty() || cleaned.iter().any(|n| n == "*") {
                TagFilter::All
            } else {
                TagFilter::Only(cleaned)
            }
        }

        pub fn is_all(&self) -> bool {
            matches!(self, TagFilter::All)
        }

        pub fn accepts(&self, tag: &TagMeta) -> bool {
            match self {
                TagFilter::All => tag.is_tagged(),
                TagFilter::Only(names) => tag
                    .main
                    .as_deref()
                    .is_some_and(|m| names.iter().any(|n| *n == m.to_lowercase())),
            }
        }
    }

    /// Remove `#main...` tokens (and one whitespace before each) from `text`, then trim.
    pub fn strip_tag(text: &str, main: &str) -> String {
        if main.is_empty() {
            return text.trim().to_string();
        }
        let needle = format!("#{}", main.to_ascii_lowercase());
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(pos) = rest.to_ascii_lowercase().find(&needle) {
            let (before, after) = rest.split_at(pos);
            let before = match before.chars().last() {
                Some(c) if c.is_whitespace() => &before[..before.len() - c.len_utf8()],
                _ => before,
            };
            out.push_str(before);
            let tail = &after[needle.len()..];
            let end = tail.find(char::is_whitespace).unwrap_or(tail.len());
            rest = &tail[end..];
        }
        out.push_str(rest);
        out.trim().to_string()
    }

}

pub mod line {
    //! Line-level grammar for checklist items plus line splitting helpers.
    //!
    //! A checklist line is: an optional run of whitespace / `>` (indentation and
    //! blockquotes), a list marker (`-`, `*` or `N.`), one whitespace character,
    //! a bracketed single-character status, 1–4 whitespace characters, and
    //! non-blank content.

    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{take_till1, take_while, take_while_m_n},
        character::complete::{anychar, char, digit1, satisfy},
        combinator::{map, recognize, rest, verify},
        error::VerboseError,
        sequence::{delimited, terminated, tuple},
    };

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum ListMarker<'a> {
        Dash,
        Star,
        /// Digits of an ordered item, e.g. `"12"` for `12.`.
        Ordinal(&'a str),
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ChecklistLine<'a> {
        pub marker: ListMarker<'a>,
        pub status: char,
        /// Leading whitespace before the marker; 0 inside blockquotes.
        pub indent: usize,
        /// Everything after the checkbox and its separating whitespace.
        pub content: &'a str,
    }

    impl ChecklistLine<'_> {
        pub fn is_checked(&self) -> bool {
            self.status == 'x'
        }
    }

    pub fn parse_checklist_line(line: &str) -> Option<ChecklistLine<'_>> {
        checklist_line(line).ok().map(|(_, parsed)| parsed)
    }

    pub fn is_checklist_line(line: &str) -> bool {
        parse_checklist_line(line).is_some()
    }

    /// Rewrite the bracketed status of a list item to `x` or a space.
    /// Returns `None` when the line has no `[...]` status after a list marker.
    pub fn set_status(line: &str, checked: bool) -> Option<String> {
        let (after, (head, _status)) = status_span(line).ok()?;
        let mut out = String::with_capacity(line.len());
        out.push_str(head);
        out.push(if checked { 'x' } else { ' ' });
        out.push_str(after);
        Some(out)
    }

    fn is_prefix_char(c: char) -> bool {
        c.is_whitespace() || c == '>'
    }

    fn list_marker(i: &str) -> PResult<'_, ListMarker<'_>> {
        alt((
            map(char('-'), |_| ListMarker::Dash),
            map(char('*'), |_| ListMarker::Star),
            map(terminated(digit1, char('.')), ListMarker::Ordinal),
        ))(i)
    }

    fn checklist_line(i: &str) -> PResult<'_, ChecklistLine<'_>> {
        let (i, prefix) = take_while(is_prefix_char)(i)?;
        let (i, marker) = list_marker(i)?;
        let (i, _) = satisfy(char::is_whitespace)(i)?;
        let (i, status) = delimited(char('['), anychar, char(']'))(i)?;
        let (i, _) = take_while_m_n(1, 4, char::is_whitespace)(i)?;
        let (i, content) = verify(rest, |s: &str| {
            s.chars().next().is_some_and(|c| !c.is_whitespace())
        })(i)?;

        let indent = if prefix.contains('>') {
            0
        } else {
            prefix.chars().count()
        };
        Ok((
            i,
            ChecklistLine {
                marker,
                status,
                indent,
                content,
            },
        ))
    }

    /// Splits a list item into (`...[`, status) and leaves `]...` as the remainder.
    fn status_span(i: &str) -> PResult<'_, (&str, &str)> {
        let (i, head) = recognize(tuple((
            take_while(is_prefix_char),
            list_marker,
            satisfy(char::is_whitespace),
            char('['),
        )))(i)?;
        let (i, status) = take_till1(|c| c == ']')(i)?;
        let (_, _) = char(']')(i)?;
        Ok((i, (head, status)))
    }

    /* ------------------------------ Line IO ------------------------------ */

    /// Split on `\n`, dropping a trailing `\r` from each line.
    pub fn split_lines(content: &str) -> Vec<&str> {
        content
            .split('\n')
            .map(|l| l.strip_suffix('\r').unwrap_or(l))
            .collect()
    }

    /// Line ending used by `content`: `\r\n` if it contains any, else `\n`.
    pub fn line_ending(content: &str) -> &'static str {
        if content.contains("\r\n") { "\r\n" } else { "\n" }
    }

    pub fn join_lines<S: AsRef<str>>(lines: &[S], ending: &str) -> String {
        let mut out = String::new();
        for (idx, line) in lines.iter().enumerate() {
            if idx > 0 {
                out.push_str(ending);
            }
            out.push_str(line.as_ref());
        }
        out
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn parses_basic_items() {
            let open = parse_checklist_line("- [ ] buy milk").unwrap();
            assert_eq!(open.marker, ListMarker::Dash);
            assert!(!open.is_checked());
            assert_eq!(open.content, "buy milk");
            assert_eq!(open.indent, 0);

            let done = parse_checklist_line("* [x] call mom").unwrap();
            assert_eq!(done.marker, ListMarker::Star);
            assert!(done.is_checked());
        }

        #[test]
        fn status_is_case_sensitive_and_any_char() {
            assert!(!parse_checklist_line("- [X] shout").unwrap().is_checked());
            let deferred = parse_checklist_line("- [>] later").unwrap();
            assert_eq!(deferred.status, '>');
            assert!(!deferred.is_checked());
        }

        #[test]
        fn ordinal_and_blockquote_prefixes() {
            let ordered = parse_checklist_line("12. [ ] twelfth").unwrap();
            assert_eq!(ordered.marker, ListMarker::Ordinal("12"));

            let quoted = parse_checklist_line("> - [x] quoted").unwrap();
            assert_eq!(quoted.content, "quoted");
            assert_eq!(quoted.indent, 0);

            let nested = parse_checklist_line(">> 1. [ ] deep").unwrap();
            assert_eq!(nested.content, "deep");
        }

        #[test]
        fn records_indentation() {
            assert_eq!(parse_checklist_line("    - [ ] nested").unwrap().indent, 4);
            assert_eq!(parse_checklist_line("\t- [ ] tabbed").unwrap().indent, 1);
        }

        #[test]
        fn rejects_near_misses() {
            for line in [
                "- [ ]",
                "- [ ]    ",
                "- [ ]     five spaces",
                "-[ ] no space",
                "-  [ ] two spaces",
                "- [] empty",
                "+ [ ] plus marker",
                "1) [ ] paren",
                "plain text",
                "",
            ] {
                assert!(!is_checklist_line(line), "{line:?} should not match");
            }
            assert!(is_checklist_line("- [ ]    four spaces"));
        }

        #[test]
        fn set_status_rewrites_only_the_bracket() {
            assert_eq!(
                set_status("  - [ ] buy [milk]", true).as_deref(),
                Some("  - [x] buy [milk]")
            );
            assert_eq!(
                set_status("> 3. [x] done", false).as_deref(),
                Some("> 3. [ ] done")
            );
            assert_eq!(set_status("- [wip] odd", true).as_deref(), Some("- [x] odd"));
            assert_eq!(set_status("just text", true), None);
        }

        #[test]
        fn splits_and_joins_preserving_endings() {
            let crlf = "a\r\nb\r\n";
            let lines = split_lines(crlf);
            assert_eq!(lines, vec!["a", "b", ""]);
            assert_eq!(join_lines(&lines, line_ending(crlf)), crlf);

            let lf = "a\nb";
            assert_eq!(join_lines(&split_lines(lf), line_ending(lf)), lf);
        }
    }
}

pub mod markup {
    //! Inline markup tokenizer.
    //!
    //! Text is split in three passes (bold, italic, link). Each pass splits the
    //! remaining `Text` leaves and descends into containers produced by earlier
    //! passes, so `**[[Page]]**` ends up as a bold container holding a link.
    //! Bold runs first because `**` would otherwise be read as two italic markers.

    use crate::core::{ContainerKind, DisplayChunk, LinkMap, TokenChunk};
    use crate::links::split_link_body;
    use nom::{
        IResult,
        bytes::complete::{tag, take_till1, take_until},
        character::complete::char,
        combinator::verify,
        error::VerboseError,
        sequence::delimited,
    };

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /// One tokenizer pass, identified by the construct it recognises.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Pass {
        Bold,
        Italic,
        Link,
    }

    impl Pass {
        fn kind(self) -> ContainerKind {
            match self {
                Pass::Bold => ContainerKind::Bold,
                Pass::Italic => ContainerKind::Italic,
                Pass::Link => ContainerKind::Link,
            }
        }

        fn parse(self, i: &str) -> PResult<'_, &str> {
            match self {
                Pass::Bold => bold(i),
                Pass::Italic => italic(i),
                Pass::Link => wikilink(i),
            }
        }
    }

    /// Reusable tokenizer; per-call state is only the text and the line's link map.
    #[derive(Debug, Clone)]
    pub struct Tokenizer {
        passes: [Pass; 3],
    }

    impl Default for Tokenizer {
        fn default() -> Self {
            Self {
                passes: [Pass::Bold, Pass::Italic, Pass::Link],
            }
        }
    }

    impl Tokenizer {
        pub fn tokenize(&self, text: &str) -> Vec<TokenChunk> {
            let mut chunks = vec![TokenChunk::text(text)];
            for pass in self.passes {
                chunks = apply_pass(pass, chunks);
            }
            chunks
        }

        /// Tokenize then decorate in one go.
        pub fn render(&self, text: &str, links: &LinkMap) -> Vec<DisplayChunk> {
            decorate(self.tokenize(text), links)
        }
    }

    pub fn tokenize(text: &str) -> Vec<TokenChunk> {
        Tokenizer::default().tokenize(text)
    }

    /// Map tokenizer output to the display tree, resolving links through `links`.
    /// Links missing from the map are kept as their original bracketed text.
    pub fn decorate(chunks: Vec<TokenChunk>, links: &LinkMap) -> Vec<DisplayChunk> {
        let mut out: Vec<DisplayChunk> = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let next = decorate_chunk(chunk, links);
            if let (Some(DisplayChunk::Text { value: prev }), DisplayChunk::Text { value }) =
                (out.last_mut(), &next)
            {
                prev.push_str(value);
                continue;
            }
            out.push(next);
        }
        out
    }

    fn decorate_chunk(chunk: TokenChunk, links: &LinkMap) -> DisplayChunk {
        match chunk {
            TokenChunk::Text(value) => DisplayChunk::Text { value },
            TokenChunk::Container {
                kind: ContainerKind::Bold,
                children,
                ..
            } => DisplayChunk::Bold {
                children: decorate(children, links),
            },
            TokenChunk::Container {
                kind: ContainerKind::Italic,
                children,
                ..
            } => DisplayChunk::Italic {
                children: decorate(children, links),
            },
            TokenChunk::Container {
                kind: ContainerKind::Link,
                raw,
                ..
            } => {
                let (target, label) = split_link_body(&raw);
                match links.get(target) {
                    Some(meta) => {
                        let label = label
                            .filter(|l| !l.is_empty())
                            .or(Some(meta.display_name.as_str()).filter(|d| !d.is_empty()))
                            .unwrap_or(target)
                            .to_string();
                        DisplayChunk::Link {
                            children: vec![DisplayChunk::text(&label)],
                            target_path: meta.target_path.clone(),
                            label,
                        }
                    }
                    None => DisplayChunk::Text {
                        value: format!("[[{raw}]]"),
                    },
                }
            }
        }
    }

    fn apply_pass(pass: Pass, chunks: Vec<TokenChunk>) -> Vec<TokenChunk> {
        let mut out = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            match chunk {
                TokenChunk::Text(raw) => out.extend(split_text(pass, &raw)),
                TokenChunk::Container {
                    kind,
                    raw,
                    children,
                } => out.push(TokenChunk::Container {
                    kind,
                    raw,
                    children: apply_pass(pass, children),
                }),
            }
        }
        out
    }

    fn split_text(pass: Pass, text: &str) -> Vec<TokenChunk> {
        let mut out = Vec::new();
        let mut literal_start = 0;
        let mut pos = 0;
        while pos < text.len() {
            let tail = &text[pos..];
            match pass.parse(tail) {
                Ok((after, body)) => {
                    if literal_start < pos {
                        out.push(TokenChunk::text(&text[literal_start..pos]));
                    }
                    out.push(TokenChunk::Container {
                        kind: pass.kind(),
                        raw: body.to_string(),
                        children: vec![TokenChunk::text(body)],
                    });
                    pos = text.len() - after.len();
                    literal_start = pos;
                }
                Err(_) => {
                    pos += tail.chars().next().map_or(1, char::len_utf8);
                }
            }
        }
        if literal_start < text.len() {
            out.push(TokenChunk::text(&text[literal_start..]));
        }
        out
    }

    fn emphasis_body(s: &str) -> bool {
        !s.is_empty() && !s.starts_with(char::is_whitespace) && !s.ends_with(char::is_whitespace)
    }

    fn bold(i: &str) -> PResult<'_, &str> {
        delimited(tag("**"), verify(take_until("**"), emphasis_body), tag("**"))(i)
    }

    fn italic(i: &str) -> PResult<'_, &str> {
        delimited(
            char('*'),
            verify(take_till1(|c| c == '*'), emphasis_body),
            char('*'),
        )(i)
    }

    /// `[[body]]` where body has no `]`.
    pub fn wikilink(i: &str) -> PResult<'_, &str> {
        delimited(tag("[["), take_till1(|c| c == ']'), tag("]]"))(i)
    }

}

pub mod links {
    //! Link targets → document paths.

    use crate::core::{Document, LinkMap, LinkMeta, LinkOccurrence};
    use indexmap::IndexMap;

    /// Resolves a raw link target written in `source_path` to a document path.
    pub trait LinkResolver {
        fn resolve(&self, target: &str, source_path: &str) -> Option<String>;
    }

    /// Split a `[[...]]` body into target and optional label.
    pub fn split_link_body(body: &str) -> (&str, Option<&str>) {
        match body.split_once('|') {
            Some((target, label)) => (target, Some(label)),
            None => (body, None),
        }
    }

    pub fn ensure_md_extension(path: &str) -> String {
        if path.ends_with(".md") {
            path.to_string()
        } else {
            format!("{path}.md")
        }
    }

    /// Build the link map for one line from the document's link occurrences.
    /// Unresolvable targets map to `target.md`.
    pub fn build_link_map(
        links: &[LinkOccurrence],
        line: usize,
        source_path: &str,
        resolver: &dyn LinkResolver,
    ) -> LinkMap {
        let mut map = LinkMap::new();
        for link in links.iter().filter(|l| l.line == line) {
            let target_path = resolver
                .resolve(&link.target, source_path)
                .unwrap_or_else(|| ensure_md_extension(strip_heading(&link.target)));
            map.insert(
                link.target.clone(),
                LinkMeta {
                    target_path,
                    display_name: link.display.clone(),
                },
            );
        }
        map
    }

    fn strip_heading(target: &str) -> &str {
        target.split('#').next().unwrap_or(target).trim()
    }

    fn parent_dir(path: &str) -> &str {
        path.rsplit_once('/').map_or("", |(dir, _)| dir)
    }

    fn shared_prefix_len(a: &str, b: &str) -> usize {
        a.split('/')
            .zip(b.split('/'))
            .take_while(|(x, y)| x == y)
            .count()
    }

    /// Resolves against the document list: exact path, path + `.md`, then file stem.
    #[derive(Debug, Clone, Default)]
    pub struct VaultLinkResolver {
        paths: Vec<String>,
        by_stem: IndexMap<String, Vec<String>>,
    }

    impl VaultLinkResolver {
        pub fn new(documents: &[Document]) -> Self {
            let mut by_stem: IndexMap<String, Vec<String>> = IndexMap::new();
            for doc in documents {
                by_stem
                    .entry(doc.label.to_lowercase())
                    .or_default()
                    .push(doc.path.clone());
            }
            Self {
                paths: documents.iter().map(|d| d.path.clone()).collect(),
                by_stem,
            }
        }
    }

    impl LinkResolver for VaultLinkResolver {
        fn resolve(&self, target: &str, source_path: &str) -> Option<String> {
            let target = strip_heading(target);
            if target.is_empty() {
                return Some(source_path.to_string());
            }
            let with_ext = ensure_md_extension(target);
            if let Some(hit) = self.paths.iter().find(|p| **p == target || **p == with_ext) {
                return Some(hit.clone());
            }

            let file = target.rsplit('/').next().unwrap_or(target);
            let stem = file.strip_suffix(".md").unwrap_or(file).to_lowercase();
            let suffix = format!("/{}", with_ext.to_lowercase());
            let source_dir = parent_dir(source_path);
            self.by_stem
                .get(&stem)?
                .iter()
                .filter(|p| !target.contains('/') || p.to_lowercase().ends_with(&suffix))
                .min_by(|a, b| {
                    shared_prefix_len(parent_dir(b), source_dir)
                        .cmp(&shared_prefix_len(parent_dir(a), source_dir))
                        .then(a.len().cmp(&b.len()))
                        .then(a.cmp(b))
                })
                .cloned()
        }
    }

}

pub mod storage {
    //! Seams to the host: where documents live and where their metadata comes from.

    use crate::core::{Document, DocumentMetadata};
    use anyhow::Result;

    /// Line-addressable document storage.
    pub trait DocumentStore {
        /// All documents, in a stable order.
        fn documents(&self) -> Result<Vec<Document>>;

        fn read(&self, path: &str) -> Result<String>;

        fn write(&self, path: &str, content: &str) -> Result<()>;
    }

    /// Tag, link and front-matter positions for a document.
    pub trait MetadataIndex {
        fn metadata(&self, doc: &Document, content: &str) -> Result<DocumentMetadata>;
    }
}

pub mod vault {
    //! Filesystem-backed store and a Markdown metadata index.

    use crate::core::{Document, DocumentMetadata, LinkOccurrence, TagOccurrence};
    use crate::line::split_lines;
    use crate::links::split_link_body;
    use crate::markup::wikilink;
    use crate::storage::{DocumentStore, MetadataIndex};
    use anyhow::{Context, Result, bail};
    use chrono::{DateTime, Utc};
    use std::{
        fs,
        path::{Component, Path, PathBuf},
        time::SystemTime,
    };

    fn system_time_ms(t: SystemTime) -> i64 {
        DateTime::<Utc>::from(t).timestamp_millis()
    }

    /// A folder of `.md` files. Hidden directories and symlinks are skipped.
    #[derive(Debug, Clone)]
    pub struct FsVault {
        root: PathBuf,
    }

    impl FsVault {
        pub fn new(root: impl Into<PathBuf>) -> Self {
            Self { root: root.into() }
        }

        pub fn root(&self) -> &Path {
            &self.root
        }

        /// Absolute path for a store-relative path; rejects anything escaping the root.
        pub fn abs_path(&self, rel: &str) -> Result<PathBuf> {
            let rel_path = Path::new(rel);
            if rel.is_empty() || !rel_path.components().all(|c| matches!(c, Component::Normal(_)))
            {
                bail!("{:?} is not a path inside the vault", rel);
            }
            Ok(self.root.join(rel_path))
        }

        fn relative(&self, abs: &Path) -> Result<String> {
            let rel = abs
                .strip_prefix(&self.root)
                .with_context(|| format!("{:?} is outside {:?}", abs, self.root))?;
            Ok(rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/"))
        }

        fn visit_dir(&self, dir: &Path, out: &mut Vec<Document>) -> Result<()> {
            for entry in fs::read_dir(dir).with_context(|| format!("reading {:?}", dir))? {
                let entry = entry?;
                let file_type = entry.file_type()?;
                if file_type.is_symlink() {
                    continue;
                }
                let path = entry.path();
                if file_type.is_dir() {
                    if entry.file_name().to_string_lossy().starts_with('.') {
                        continue;
                    }
                    self.visit_dir(&path, out)?;
                } else if file_type.is_file() && path.extension().is_some_and(|ext| ext == "md") {
                    let meta = entry
                        .metadata()
                        .with_context(|| format!("reading metadata for {:?}", path))?;
                    let modified = meta.modified().map(system_time_ms).unwrap_or(0);
                    let created = meta.created().map(system_time_ms).unwrap_or(modified);
                    out.push(Document::new(&self.relative(&path)?, created, modified));
                }
            }
            Ok(())
        }
    }

    impl DocumentStore for FsVault {
        fn documents(&self) -> Result<Vec<Document>> {
            let mut out = Vec::new();
            self.visit_dir(&self.root, &mut out)?;
            out.sort_by(|a, b| a.path.cmp(&b.path));
            Ok(out)
        }

        fn read(&self, path: &str) -> Result<String> {
            let abs = self.abs_path(path)?;
            fs::read_to_string(&abs).with_context(|| format!("reading {:?}", abs))
        }

        fn write(&self, path: &str, content: &str) -> Result<()> {
            let abs = self.abs_path(path)?;
            fs::write(&abs, content).with_context(|| format!("writing {:?}", abs))
        }
    }

    /// Computes tag, link and front-matter metadata straight from Markdown text.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct MarkdownIndex;

    impl MetadataIndex for MarkdownIndex {
        fn metadata(&self, _doc: &Document, content: &str) -> Result<DocumentMetadata> {
            Ok(index_markdown(content))
        }
    }

    pub fn index_markdown(content: &str) -> DocumentMetadata {
        let lines = split_lines(content);
        let mut meta = DocumentMetadata::default();

        let body_start = match front_matter(&lines) {
            Some((yaml, end)) => {
                meta.frontmatter_tags = frontmatter_tags(&yaml);
                end
            }
            None => 0,
        };

        let mut fence: Option<&str> = None;
        for (idx, line) in lines.iter().enumerate().skip(body_start) {
            let trimmed = line.trim_start();
            if let Some(open) = fence {
                if trimmed.starts_with(open) {
                    fence = None;
                }
                continue;
            }
            if trimmed.starts_with("```") {
                fence = Some("```");
                continue;
            }
            if trimmed.starts_with("~~~") {
                fence = Some("~~~");
                continue;
            }

            for tag in inline_tags(line) {
                meta.tags.push(TagOccurrence { tag, line: idx });
            }
            for (target, display) in inline_links(line) {
                meta.links.push(LinkOccurrence {
                    target,
                    display,
                    line: idx,
                });
            }
        }
        meta
    }

    /// Returns the YAML between `---` fences and the first body line index.
    fn front_matter(lines: &[&str]) -> Option<(String, usize)> {
        if lines.first()?.trim_end() != "---" {
            return None;
        }
        let close = lines
            .iter()
            .enumerate()
            .skip(1)
            .find(|(_, l)| matches!(l.trim_end(), "---" | "..."))
            .map(|(idx, _)| idx)?;
        Some((lines[1..close].join("\n"), close + 1))
    }

    /// `tags:` / `tag:` as a YAML list or a comma/space separated string.
    fn frontmatter_tags(yaml: &str) -> Vec<String> {
        use serde_yaml::Value;

        fn scalar(v: &Value) -> Option<String> {
            match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            }
        }

        let Ok(value) = serde_yaml::from_str::<Value>(yaml) else {
            return vec![];
        };
        let mut raw = Vec::new();
        for key in ["tags", "tag"] {
            match value.get(key) {
                Some(Value::Sequence(items)) => raw.extend(items.iter().filter_map(scalar)),
                Some(other) => {
                    if let Some(s) = scalar(other) {
                        raw.extend(
                            s.split(|c: char| c == ',' || c.is_whitespace())
                                .map(str::to_string),
                        );
                    }
                }
                None => {}
            }
        }

        let mut out: Vec<String> = Vec::new();
        for t in raw {
            let t = t.trim().trim_start_matches('#');
            if t.is_empty() {
                continue;
            }
            let tag = format!("#{t}");
            if !out.contains(&tag) {
                out.push(tag);
            }
        }
        out
    }

    fn is_tag_char(c: char) -> bool {
        c.is_alphanumeric() || c == '_' || c == '-' || c == '/'
    }

    /// `#tag` tokens that start a word, outside inline code. Numeric-only tags are skipped.
    fn inline_tags(line: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut prev: Option<char> = None;
        let mut in_code = false;
        for (idx, c) in line.char_indices() {
            if c == '`' {
                in_code = !in_code;
            } else if c == '#' && !in_code && prev.is_none_or(char::is_whitespace) {
                let tail = &line[idx + 1..];
                let end = tail.find(|c: char| !is_tag_char(c)).unwrap_or(tail.len());
                let body = tail[..end].trim_end_matches('/');
                if !body.is_empty() && !body.chars().all(|c| c.is_ascii_digit()) {
                    out.push(format!("#{body}"));
                }
            }
            prev = Some(c);
        }
        out
    }

    /// `[[target|alias]]` links, skipping `![[embeds]]`.
    fn inline_links(line: &str) -> Vec<(String, String)> {
        let mut out = Vec::new();
        let mut pos = 0;
        while let Some(offset) = line[pos..].find("[[") {
            let start = pos + offset;
            match wikilink(&line[start..]) {
                Ok((rest, body)) => {
                    if !line[..start].ends_with('!') {
                        let (target, alias) = split_link_body(body);
                        let display = alias.unwrap_or(target);
                        out.push((target.to_string(), display.to_string()));
                    }
                    pos = line.len() - rest.len();
                }
                Err(_) => pos = start + 2,
            }
        }
        out
    }

}

pub mod settings {
    //! User configuration, loaded from `.checklist.json` at the vault root.

    use crate::core::{GroupBy, SortDirection};
    use crate::tags::TagFilter;
    use globset::{Glob, GlobSet, GlobSetBuilder};
    use serde::{Deserialize, Serialize};
    use std::{fs, io, path::Path};

    pub const SETTINGS_FILE: &str = ".checklist.json";

    #[derive(Debug, thiserror::Error)]
    pub enum SettingsError {
        #[error("reading settings {path}")]
        Io {
            path: String,
            #[source]
            source: io::Error,
        },
        #[error("parsing settings {path}")]
        Parse {
            path: String,
            #[source]
            source: serde_json::Error,
        },
        #[error("invalid include pattern {pattern:?}")]
        Glob {
            pattern: String,
            #[source]
            source: globset::Error,
        },
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default, rename_all = "camelCase")]
    pub struct Settings {
        /// Tag names (without `#`) that mark todo blocks; `*` scans every file.
        pub todo_tags: Vec<String>,
        /// Newline-separated globs of files to include; blank includes everything.
        pub include_files: String,
        pub show_checked: bool,
        pub group_by: GroupBy,
        pub sort_direction_groups: SortDirection,
        pub sort_direction_items: SortDirection,
        pub sub_groups: bool,
        pub sort_direction_sub_groups: SortDirection,
    }

    impl Default for Settings {
        fn default() -> Self {
            Self {
                todo_tags: vec!["todo".to_string()],
                include_files: String::new(),
                show_checked: false,
                group_by: GroupBy::Page,
                sort_direction_groups: SortDirection::NewestFirst,
                sort_direction_items: SortDirection::AlphabeticAsc,
                sub_groups: false,
                sort_direction_sub_groups: SortDirection::AlphabeticAsc,
            }
        }
    }

    impl Settings {
        pub fn load(path: &Path) -> Result<Self, SettingsError> {
            let text = fs::read_to_string(path).map_err(|source| SettingsError::Io {
                path: path.display().to_string(),
                source,
            })?;
            serde_json::from_str(&text).map_err(|source| SettingsError::Parse {
                path: path.display().to_string(),
                source,
            })
        }

        /// `root/.checklist.json` if present, defaults otherwise.
        pub fn discover(root: &Path) -> Result<Self, SettingsError> {
            let path = root.join(SETTINGS_FILE);
            if path.is_file() {
                Self::load(&path)
            } else {
                Ok(Self::default())
            }
        }

        pub fn tag_filter(&self) -> TagFilter {
            TagFilter::from_names(&self.todo_tags)
        }

        pub fn include_patterns(&self) -> Vec<String> {
            let patterns: Vec<String> = self
                .include_files
                .lines()
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect();
            if patterns.is_empty() {
                vec!["**/*".to_string()]
            } else {
                patterns
            }
        }

        pub fn include_matcher(&self) -> Result<GlobSet, SettingsError> {
            let patterns = self.include_patterns();
            let mut builder = GlobSetBuilder::new();
            for pattern in &patterns {
                let glob = Glob::new(pattern).map_err(|source| SettingsError::Glob {
                    pattern: pattern.clone(),
                    source,
                })?;
                builder.add(glob);
            }
            builder.build().map_err(|source| SettingsError::Glob {
                pattern: patterns.join("\n"),
                source,
            })
        }
    }

}

pub mod scanner {
    //! Extracts todo items from documents.
    //!
    //! Whole-file mode (wildcard filter or a matching front-matter tag) tests every
    //! line. Tag-block mode starts at each matching `#tag`: if the tag's own line is
    //! a checklist item only that item is taken, otherwise lines below are scanned
    //! until a blank line. One blank line directly under the tag is tolerated.

    use crate::core::{Document, DocumentMetadata, TagMeta, TodoItem};
    use crate::line::{parse_checklist_line, split_lines};
    use crate::links::{LinkResolver, build_link_map};
    use crate::markup::Tokenizer;
    use crate::settings::{Settings, SettingsError};
    use crate::storage::{DocumentStore, MetadataIndex};
    use crate::tags::{TagFilter, resolve, strip_tag};
    use globset::GlobSet;
    use indexmap::IndexMap;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Immutable configuration snapshot for one scan.
    #[derive(Debug, Clone)]
    pub struct ScanConfig {
        pub filter: TagFilter,
        pub show_checked: bool,
        /// `None` includes every document.
        pub include: Option<GlobSet>,
    }

    impl ScanConfig {
        pub fn new(filter: TagFilter, show_checked: bool) -> Self {
            Self {
                filter,
                show_checked,
                include: None,
            }
        }

        pub fn from_settings(settings: &Settings) -> Result<Self, SettingsError> {
            Ok(Self {
                filter: settings.tag_filter(),
                show_checked: settings.show_checked,
                include: Some(settings.include_matcher()?),
            })
        }

        pub fn includes(&self, path: &str) -> bool {
            self.include.as_ref().is_none_or(|set| set.is_match(path))
        }
    }

    /// Which documents to scan. Empty request = everything.
    #[derive(Debug, Clone, Default)]
    pub struct ScanRequest {
        /// Only these store paths.
        pub files: Option<Vec<String>>,
        /// Skip documents last modified before this epoch-ms cutoff.
        pub modified_since: Option<i64>,
    }

    #[derive(Debug, Clone, Default)]
    pub struct ScanOptions {
        pub verbose: bool,
        /// Checked between documents; once set the scan stops early.
        pub cancel: Option<Arc<AtomicBool>>,
    }

    impl ScanOptions {
        pub fn with_verbose(verbose: bool) -> Self {
            Self {
                verbose,
                cancel: None,
            }
        }

        fn cancelled(&self) -> bool {
            self.cancel
                .as_ref()
                .is_some_and(|flag| flag.load(Ordering::Relaxed))
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ScanWarning {
        pub path: String,
        pub message: String,
    }

    #[derive(Debug, Clone, Default)]
    pub struct ScanReport {
        /// Every scanned document, in store order, including those with no items.
        pub by_file: IndexMap<String, Vec<TodoItem>>,
        pub warnings: Vec<ScanWarning>,
        pub cancelled: bool,
    }

    impl ScanReport {
        /// Flat item list in document order.
        pub fn items(&self) -> Vec<TodoItem> {
            dedupe(self.by_file.values().flatten().cloned().collect())
        }
    }

    /// Drop repeated `(file_path, line)` pairs, keeping the first.
    pub fn dedupe(items: Vec<TodoItem>) -> Vec<TodoItem> {
        let mut seen = HashSet::new();
        items
            .into_iter()
            .filter(|item| seen.insert((item.file_path.clone(), item.line)))
            .collect()
    }

    /// List the store's documents and scan the ones selected by `request`.
    pub fn scan(
        store: &dyn DocumentStore,
        index: &dyn MetadataIndex,
        resolver: &dyn LinkResolver,
        config: &ScanConfig,
        request: &ScanRequest,
        options: &ScanOptions,
    ) -> ScanReport {
        match store.documents() {
            Ok(docs) => scan_documents(&docs, store, index, resolver, config, request, options),
            Err(err) => ScanReport {
                warnings: vec![ScanWarning {
                    path: String::new(),
                    message: format!("listing documents: {err:#}"),
                }],
                ..ScanReport::default()
            },
        }
    }

    /// Scan an already-listed set of documents. A document that cannot be read or
    /// indexed contributes no items and a warning; the rest are still scanned.
    pub fn scan_documents(
        docs: &[Document],
        store: &dyn DocumentStore,
        index: &dyn MetadataIndex,
        resolver: &dyn LinkResolver,
        config: &ScanConfig,
        request: &ScanRequest,
        options: &ScanOptions,
    ) -> ScanReport {
        let tokenizer = Tokenizer::default();
        let mut report = ScanReport::default();

        for doc in docs {
            if let Some(files) = &request.files {
                if !files.iter().any(|f| *f == doc.path) {
                    continue;
                }
            }
            if request.modified_since.is_some_and(|cutoff| doc.modified_ts < cutoff) {
                continue;
            }
            if !config.includes(&doc.path) {
                continue;
            }
            if options.cancelled() {
                if options.verbose {
                    eprintln!("Scan cancelled before {:?}", doc.path);
                }
                report.cancelled = true;
                break;
            }

            if options.verbose {
                eprintln!("Scanning {:?}", doc.path);
            }
            let items = match store.read(&doc.path) {
                Ok(content) => match index.metadata(doc, &content) {
                    Ok(meta) => scan_document(doc, &content, &meta, resolver, config, &tokenizer),
                    Err(err) => {
                        report.warnings.push(ScanWarning {
                            path: doc.path.clone(),
                            message: format!("indexing: {err:#}"),
                        });
                        Vec::new()
                    }
                },
                Err(err) => {
                    report.warnings.push(ScanWarning {
                        path: doc.path.clone(),
                        message: format!("reading: {err:#}"),
                    });
                    Vec::new()
                }
            };
            if options.verbose && !items.is_empty() {
                eprintln!("  {} item(s) in {:?}", items.len(), doc.path);
            }
            report.by_file.insert(doc.path.clone(), items);
        }
        report
    }

    /// Extract the todo items of a single document.
    pub fn scan_document(
        doc: &Document,
        content: &str,
        meta: &DocumentMetadata,
        resolver: &dyn LinkResolver,
        config: &ScanConfig,
        tokenizer: &Tokenizer,
    ) -> Vec<TodoItem> {
        let lines = split_lines(content);
        let mut collector = Collector {
            doc,
            lines: &lines,
            meta,
            resolver,
            tokenizer,
            seen: HashSet::new(),
            items: Vec::new(),
        };

        let frontmatter_tag = meta
            .frontmatter_tags
            .iter()
            .map(|t| resolve(t))
            .find(|t| config.filter.accepts(t));

        if config.filter.is_all() || frontmatter_tag.is_some() {
            let tag = frontmatter_tag.unwrap_or_default();
            for idx in 0..lines.len() {
                collector.take(idx, &tag);
            }
        } else {
            for occurrence in &meta.tags {
                let tag = resolve(&occurrence.tag);
                if config.filter.accepts(&tag) {
                    collector.take_block(occurrence.line, &tag);
                }
            }
        }

        let mut items = collector.items;
        if !config.show_checked {
            items.retain(|item| !item.checked);
        }
        items
    }

    struct Collector<'a> {
        doc: &'a Document,
        lines: &'a [&'a str],
        meta: &'a DocumentMetadata,
        resolver: &'a dyn LinkResolver,
        tokenizer: &'a Tokenizer,
        seen: HashSet<usize>,
        items: Vec<TodoItem>,
    }

    impl Collector<'_> {
        fn take_block(&mut self, start: usize, tag: &TagMeta) {
            if start >= self.lines.len() || self.take(start, tag) {
                return;
            }
            for (offset, idx) in (start + 1..self.lines.len()).enumerate() {
                if self.lines[idx].trim().is_empty() {
                    if offset == 0 {
                        continue;
                    }
                    break;
                }
                self.take(idx, tag);
            }
        }

        /// Returns whether `idx` is a checklist line; records it unless already taken.
        fn take(&mut self, idx: usize, tag: &TagMeta) -> bool {
            let Some(parsed) = parse_checklist_line(self.lines[idx]) else {
                return false;
            };
            if !self.seen.insert(idx) {
                return true;
            }

            let text = match &tag.main {
                Some(main) => strip_tag(parsed.content, main),
                None => parsed.content.trim().to_string(),
            };
            let links = build_link_map(&self.meta.links, idx, &self.doc.path, self.resolver);
            self.items.push(TodoItem {
                checked: parsed.is_checked(),
                display: self.tokenizer.render(&text, &links),
                file_path: self.doc.path.clone(),
                file_name: self.doc.name.clone(),
                file_label: self.doc.label.clone(),
                file_created_ts: self.doc.created_ts,
                main_tag: tag.main.clone(),
                sub_tag: tag.sub.clone(),
                line: idx,
                indent_spaces: parsed.indent,
                original_text: text,
                source_text: parsed.content.trim_end().to_string(),
            });
            true
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::core::DisplayChunk;
        use crate::links::VaultLinkResolver;
        use crate::testing::MemoryStore;
        use crate::vault::{MarkdownIndex, index_markdown};

        fn todo_config() -> ScanConfig {
            ScanConfig::new(TagFilter::from_names(&["todo"]), true)
        }

        fn scan_text(content: &str, config: &ScanConfig) -> Vec<TodoItem> {
            let doc = Document::new("notes/list.md", 1_000, 2_000);
            let meta = index_markdown(content);
            let resolver = VaultLinkResolver::new(&[doc.clone(), Document::new("Page.md", 0, 0)]);
            scan_document(&doc, content, &meta, &resolver, config, &Tokenizer::default())
        }

        fn lines_of(items: &[TodoItem]) -> Vec<usize> {
            items.iter().map(|i| i.line).collect()
        }

        #[test]
        fn tag_block_stops_at_blank_line() {
            let items = scan_text(
                "#todo\n- [ ] buy milk\n- [x] call mom\n\n- [ ] unrelated",
                &todo_config(),
            );
            assert_eq!(lines_of(&items), vec![1, 2]);
            assert_eq!(
                items.iter().map(|i| i.checked).collect::<Vec<_>>(),
                vec![false, true]
            );
            assert_eq!(items[0].main_tag.as_deref(), Some("todo"));
            assert_eq!(items[0].display, vec![DisplayChunk::text("buy milk")]);
            assert_eq!(items[0].file_label, "list");
            assert_eq!(items[0].file_created_ts, 1_000);
        }

        #[test]
        fn one_blank_line_after_the_tag_is_tolerated() {
            let items = scan_text("#todo\n\n- [ ] a\n- [ ] b\n", &todo_config());
            assert_eq!(lines_of(&items), vec![2, 3]);
        }

        #[test]
        fn two_blank_lines_after_the_tag_end_the_block() {
            let items = scan_text("#todo\n\n\n- [ ] a\n", &todo_config());
            assert!(items.is_empty());
        }

        #[test]
        fn non_checklist_lines_inside_a_block_are_skipped() {
            let items = scan_text("Errands #todo\nsome prose\n- [ ] a\n* [ ] b\n", &todo_config());
            assert_eq!(lines_of(&items), vec![2, 3]);
        }

        #[test]
        fn tag_on_a_checklist_line_takes_only_that_line() {
            let items = scan_text(
                "- [ ] water plants #todo/home\n- [ ] not tagged\n",
                &todo_config(),
            );
            assert_eq!(lines_of(&items), vec![0]);
            assert_eq!(items[0].sub_tag.as_deref(), Some("home"));
            assert_eq!(items[0].display, vec![DisplayChunk::text("water plants")]);
            assert_eq!(items[0].original_text, "water plants");
            assert_eq!(items[0].source_text, "water plants #todo/home");
        }

        #[test]
        fn leading_tags_do_not_affect_alphabetical_order() {
            use crate::core::{GroupBy, SortDirection};
            use crate::grouping::group_todos;

            let items = scan_text("- [ ] #todo zebra\n- [ ] apple #todo\n", &todo_config());
            assert_eq!(
                items.iter().map(|i| i.original_text.as_str()).collect::<Vec<_>>(),
                vec!["zebra", "apple"]
            );
            let groups = group_todos(
                &items,
                GroupBy::Page,
                SortDirection::AlphabeticAsc,
                SortDirection::AlphabeticAsc,
                false,
                SortDirection::AlphabeticAsc,
            );
            let texts: Vec<&str> = groups[0].todos.iter().map(|t| t.original_text.as_str()).collect();
            assert_eq!(texts, vec!["apple", "zebra"]);
        }

        #[test]
        fn two_tags_on_one_line_yield_one_item() {
            let items = scan_text("- [ ] shared #todo #todo/work\n", &todo_config());
            assert_eq!(items.len(), 1);
            assert_eq!(items[0].sub_tag, None);
        }

        #[test]
        fn overlapping_blocks_keep_the_first_occurrence() {
            let items = scan_text("#todo/home\n- [ ] a #todo/work\n- [ ] b\n", &todo_config());
            assert_eq!(lines_of(&items), vec![1, 2]);
            assert!(items.iter().all(|i| i.sub_tag.as_deref() == Some("home")));
        }

        #[test]
        fn other_tags_are_ignored() {
            let items = scan_text("#later\n- [ ] a\n", &todo_config());
            assert!(items.is_empty());
        }

        #[test]
        fn wildcard_scans_every_line() {
            let config = ScanConfig::new(TagFilter::All, true);
            let items = scan_text("- [ ] a\n\nprose\n\n  - [x] b\n", &config);
            assert_eq!(lines_of(&items), vec![0, 4]);
            assert_eq!(items[1].indent_spaces, 2);
            assert!(items.iter().all(|i| i.main_tag.is_none()));
        }

        #[test]
        fn matching_front_matter_tag_scans_whole_file() {
            let items = scan_text(
                "---\ntags: [todo/project]\n---\n- [ ] a\n\n\n- [ ] b\n",
                &todo_config(),
            );
            assert_eq!(lines_of(&items), vec![3, 6]);
            assert!(items.iter().all(|i| i.sub_tag.as_deref() == Some("project")));
        }

        #[test]
        fn hides_checked_items_unless_requested() {
            let config = ScanConfig::new(TagFilter::from_names(&["todo"]), false);
            let items = scan_text("#todo\n- [ ] a\n- [x] b\n", &config);
            assert_eq!(lines_of(&items), vec![1]);
        }

        #[test]
        fn links_on_the_line_are_resolved() {
            let items = scan_text("#todo\n- [ ] read [[Page|the page]] and [[Gone]]\n", &todo_config());
            assert_eq!(
                items[0].display,
                vec![
                    DisplayChunk::text("read "),
                    DisplayChunk::Link {
                        children: vec![DisplayChunk::text("the page")],
                        target_path: "Page.md".to_string(),
                        label: "the page".to_string(),
                    },
                    DisplayChunk::text(" and "),
                    DisplayChunk::Link {
                        children: vec![DisplayChunk::text("Gone")],
                        target_path: "Gone.md".to_string(),
                        label: "Gone".to_string(),
                    },
                ]
            );
        }

        #[test]
        fn tag_past_end_of_file_is_harmless() {
            let doc = Document::new("a.md", 0, 0);
            let meta = DocumentMetadata {
                tags: vec![crate::core::TagOccurrence {
                    tag: "#todo".into(),
                    line: 40,
                }],
                ..DocumentMetadata::default()
            };
            let resolver = VaultLinkResolver::default();
            let items = scan_document(
                &doc,
                "- [ ] a",
                &meta,
                &resolver,
                &todo_config(),
                &Tokenizer::default(),
            );
            assert!(items.is_empty());
        }

        #[test]
        fn unreadable_documents_do_not_stop_the_scan() {
            let store = MemoryStore::with(&[
                ("a.md", 1, "#todo\n- [ ] from a"),
                ("b.md", 2, "#todo\n- [ ] from b"),
                ("c.md", 3, "#todo\n- [ ] from c"),
            ]);
            store.fail_reads_for("b.md");
            let docs = store.documents().expect("docs");
            let resolver = VaultLinkResolver::new(&docs);

            let report = scan(
                &store,
                &MarkdownIndex,
                &resolver,
                &todo_config(),
                &ScanRequest::default(),
                &ScanOptions::default(),
            );
            assert_eq!(
                report.by_file.keys().collect::<Vec<_>>(),
                vec!["a.md", "b.md", "c.md"]
            );
            assert!(report.by_file["b.md"].is_empty());
            assert_eq!(report.warnings.len(), 1);
            assert_eq!(report.warnings[0].path, "b.md");
            let paths: Vec<String> = report.items().into_iter().map(|i| i.file_path).collect();
            assert_eq!(paths, vec!["a.md", "c.md"]);
        }

        #[test]
        fn request_limits_files_and_modification_time() {
            let store = MemoryStore::with(&[
                ("a.md", 100, "#todo\n- [ ] a"),
                ("b.md", 200, "#todo\n- [ ] b"),
                ("c.md", 300, "#todo\n- [ ] c"),
            ]);
            let resolver = VaultLinkResolver::default();
            let run = |request: ScanRequest| {
                scan(
                    &store,
                    &MarkdownIndex,
                    &resolver,
                    &todo_config(),
                    &request,
                    &ScanOptions::default(),
                )
                .by_file
                .keys()
                .cloned()
                .collect::<Vec<_>>()
            };

            assert_eq!(
                run(ScanRequest {
                    modified_since: Some(200),
                    ..ScanRequest::default()
                }),
                vec!["b.md", "c.md"]
            );
            assert_eq!(
                run(ScanRequest {
                    files: Some(vec!["c.md".into(), "a.md".into()]),
                    ..ScanRequest::default()
                }),
                vec!["a.md", "c.md"]
            );
        }

        #[test]
        fn include_globs_filter_documents() {
            let store = MemoryStore::with(&[
                ("inbox.md", 1, "#todo\n- [ ] a"),
                ("projects/x.md", 1, "#todo\n- [ ] b"),
            ]);
            let settings = Settings {
                include_files: "projects/**".into(),
                ..Settings::default()
            };
            let config = ScanConfig::from_settings(&settings).expect("config");
            let report = scan(
                &store,
                &MarkdownIndex,
                &VaultLinkResolver::default(),
                &config,
                &ScanRequest::default(),
                &ScanOptions::default(),
            );
            assert_eq!(report.by_file.keys().collect::<Vec<_>>(), vec!["projects/x.md"]);
        }

        #[test]
        fn cancelled_scan_stops_between_documents() {
            let store = MemoryStore::with(&[("a.md", 1, "#todo\n- [ ] a")]);
            let options = ScanOptions {
                verbose: false,
                cancel: Some(Arc::new(AtomicBool::new(true))),
            };
            let report = scan(
                &store,
                &MarkdownIndex,
                &VaultLinkResolver::default(),
                &todo_config(),
                &ScanRequest::default(),
                &options,
            );
            assert!(report.cancelled);
            assert!(report.by_file.is_empty());
        }
    }
}

pub mod grouping {
    //! Groups items by page or tag and sorts groups and items.

    use crate::core::{GroupBy, SortDirection, TodoGroup, TodoItem};
    use crate::settings::Settings;
    use indexmap::IndexMap;
    use std::cmp::Ordering;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GroupOptions {
        pub group_by: GroupBy,
        pub sort_groups: SortDirection,
        pub sort_items: SortDirection,
        pub sub_groups: bool,
        pub sort_sub_groups: SortDirection,
    }

    impl From<&Settings> for GroupOptions {
        fn from(s: &Settings) -> Self {
            Self {
                group_by: s.group_by,
                sort_groups: s.sort_direction_groups,
                sort_items: s.sort_direction_items,
                sub_groups: s.sub_groups,
                sort_sub_groups: s.sort_direction_sub_groups,
            }
        }
    }

    pub fn group_with(items: &[TodoItem], opts: GroupOptions) -> Vec<TodoGroup> {
        group_todos(
            items,
            opts.group_by,
            opts.sort_groups,
            opts.sort_items,
            opts.sub_groups,
            opts.sort_sub_groups,
        )
    }

    /// Group `items` in input order, then sort. With `sub_groups`, each group's
    /// items are grouped again on the other axis (one level only).
    pub fn group_todos(
        items: &[TodoItem],
        group_by: GroupBy,
        sort_groups: SortDirection,
        sort_items: SortDirection,
        sub_groups: bool,
        sort_sub_groups: SortDirection,
    ) -> Vec<TodoGroup> {
        let mut groups: IndexMap<String, TodoGroup> = IndexMap::new();
        for item in items {
            let key = group_key(item, group_by);
            let group = groups
                .entry(key.clone())
                .or_insert_with(|| new_group(key, item, group_by));
            group.oldest_item_ts = group.oldest_item_ts.min(item.file_created_ts);
            group.newest_item_ts = group.newest_item_ts.max(item.file_created_ts);
            group.todos.push(item.clone());
        }

        let mut groups: Vec<TodoGroup> = groups
            .into_values()
            .filter(|g| !g.todos.is_empty())
            .collect();
        sort_groups_by(&mut groups, sort_groups);

        for group in &mut groups {
            sort_items_by(&mut group.todos, sort_items);
            if sub_groups {
                group.subgroups = Some(group_todos(
                    &group.todos,
                    group_by.other(),
                    sort_sub_groups,
                    sort_items,
                    false,
                    sort_sub_groups,
                ));
            }
        }
        groups
    }

    fn group_key(item: &TodoItem, group_by: GroupBy) -> String {
        match group_by {
            GroupBy::Page => item.file_path.clone(),
            GroupBy::Tag => item.tag_meta().key(),
        }
    }

    fn new_group(id: String, first: &TodoItem, kind: GroupBy) -> TodoGroup {
        let (sort_name, display_name) = match kind {
            GroupBy::Page => (first.file_name.clone(), first.file_label.clone()),
            GroupBy::Tag => (
                format!(
                    "{}{}",
                    first.main_tag.as_deref().unwrap_or(""),
                    first.sub_tag.as_deref().unwrap_or("0")
                ),
                id.clone(),
            ),
        };
        TodoGroup {
            id,
            kind,
            todos: Vec::new(),
            sort_name,
            display_name,
            oldest_item_ts: first.file_created_ts,
            newest_item_ts: first.file_created_ts,
            subgroups: None,
        }
    }

    pub fn sort_groups_by(groups: &mut [TodoGroup], direction: SortDirection) {
        match direction {
            SortDirection::AlphabeticAsc => {
                groups.sort_by(|a, b| locale_compare(&a.sort_name, &b.sort_name))
            }
            SortDirection::AlphabeticDesc => {
                groups.sort_by(|a, b| locale_compare(&b.sort_name, &a.sort_name))
            }
            SortDirection::NewestFirst => groups.sort_by(|a, b| b.newest_item_ts.cmp(&a.newest_item_ts)),
            SortDirection::OldestFirst => groups.sort_by(|a, b| a.oldest_item_ts.cmp(&b.oldest_item_ts)),
        }
    }

    pub fn sort_items_by(items: &mut [TodoItem], direction: SortDirection) {
        match direction {
            SortDirection::AlphabeticAsc => {
                items.sort_by(|a, b| locale_compare(&a.original_text, &b.original_text))
            }
            SortDirection::AlphabeticDesc => {
                items.sort_by(|a, b| locale_compare(&b.original_text, &a.original_text))
            }
            SortDirection::NewestFirst => items.sort_by(|a, b| b.file_created_ts.cmp(&a.file_created_ts)),
            SortDirection::OldestFirst => items.sort_by(|a, b| a.file_created_ts.cmp(&b.file_created_ts)),
        }
    }

    /// Case-insensitive comparison with digit runs compared numerically
    /// (`item 2` < `item 10`). Strings equal under this order keep input order.
    pub fn locale_compare(a: &str, b: &str) -> Ordering {
        let mut xs = a.chars().peekable();
        let mut ys = b.chars().peekable();
        loop {
            match (xs.peek().copied(), ys.peek().copied()) {
                (None, None) => return Ordering::Equal,
                (None, Some(_)) => return Ordering::Less,
                (Some(_), None) => return Ordering::Greater,
                (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                    let nx = take_digits(&mut xs);
                    let ny = take_digits(&mut ys);
                    let ord = nx
                        .trim_start_matches('0')
                        .len()
                        .cmp(&ny.trim_start_matches('0').len())
                        .then_with(|| nx.trim_start_matches('0').cmp(ny.trim_start_matches('0')));
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                (Some(x), Some(y)) => {
                    let ord = x.to_lowercase().cmp(y.to_lowercase());
                    if ord != Ordering::Equal {
                        return ord;
                    }
                    xs.next();
                    ys.next();
                }
            }
        }
    }

    fn take_digits(it: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
        let mut out = String::new();
        while let Some(c) = it.peek().copied().filter(char::is_ascii_digit) {
            out.push(c);
            it.next();
        }
        out
    }

}

pub mod toggle {
    //! Flips a checklist item's checkbox in its source file.
    //!
    //! The file is re-read first; if the item's line no longer contains the text
    //! captured at scan time nothing is written and the item is left alone.

    use crate::core::TodoItem;
    use crate::line::{join_lines, line_ending, set_status, split_lines};
    use crate::storage::DocumentStore;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex, PoisonError};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum ToggleOutcome {
        /// Written; `checked` is the item's new state.
        Toggled { checked: bool },
        /// The line changed since the scan; nothing was written.
        Stale,
    }

    #[derive(Debug, thiserror::Error)]
    pub enum ToggleError {
        #[error("reading {path}")]
        Read {
            path: String,
            #[source]
            source: anyhow::Error,
        },
        #[error("writing {path}")]
        Write {
            path: String,
            #[source]
            source: anyhow::Error,
        },
        #[error("no todo item at {path}:{line}")]
        NotFound { path: String, line: usize },
    }

    /// New file content with the item's checkbox flipped, or `None` if the item is stale.
    pub fn apply_toggle(content: &str, item: &TodoItem) -> Option<String> {
        let mut lines: Vec<String> = split_lines(content).into_iter().map(str::to_string).collect();
        let current = lines.get(item.line)?;
        if !current.contains(&item.source_text) {
            return None;
        }
        lines[item.line] = set_status(current, !item.checked)?;
        Some(join_lines(&lines, line_ending(content)))
    }

    /// Toggle through caller-supplied read/write callbacks.
    pub fn toggle_with<R, W>(item: &mut TodoItem, read: R, write: W) -> Result<ToggleOutcome, ToggleError>
    where
        R: FnOnce(&str) -> anyhow::Result<String>,
        W: FnOnce(&str, &str) -> anyhow::Result<()>,
    {
        let content = read(&item.file_path).map_err(|source| ToggleError::Read {
            path: item.file_path.clone(),
            source,
        })?;
        let Some(updated) = apply_toggle(&content, item) else {
            return Ok(ToggleOutcome::Stale);
        };
        write(&item.file_path, &updated).map_err(|source| ToggleError::Write {
            path: item.file_path.clone(),
            source,
        })?;
        item.checked = !item.checked;
        Ok(ToggleOutcome::Toggled {
            checked: item.checked,
        })
    }

    pub fn toggle_item(item: &mut TodoItem, store: &dyn DocumentStore) -> Result<ToggleOutcome, ToggleError> {
        toggle_with(item, |path| store.read(path), |path, content| store.write(path, content))
    }

    /// One lock per file path so toggles on the same file never overlap.
    #[derive(Debug, Default)]
    pub struct FileLocks {
        locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    }

    impl FileLocks {
        pub fn lock_for(&self, path: &str) -> Arc<Mutex<()>> {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(path.to_string()).or_default().clone()
        }

        /// Toggle `item` while holding its file's lock.
        pub fn toggle(
            &self,
            item: &mut TodoItem,
            store: &dyn DocumentStore,
        ) -> Result<ToggleOutcome, ToggleError> {
            let lock = self.lock_for(&item.file_path);
            let result = {
                let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
                toggle_item(item, store)
            };
            self.release(&item.file_path, lock);
            result
        }

        /// Number of paths currently holding a lock entry.
        pub fn tracked_paths(&self) -> usize {
            self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
        }

        /// Drop the map entry once nobody else holds the path's lock.
        fn release(&self, path: &str, lock: Arc<Mutex<()>>) {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            drop(lock);
            if locks.get(path).is_some_and(|l| Arc::strong_count(l) == 1) {
                locks.remove(path);
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::links::VaultLinkResolver;
        use crate::markup::Tokenizer;
        use crate::scanner::{ScanConfig, scan_document};
        use crate::tags::TagFilter;
        use crate::testing::MemoryStore;
        use crate::vault::index_markdown;

        fn scan_one(store: &MemoryStore, path: &str) -> Vec<TodoItem> {
            let docs = store.documents().expect("docs");
            let doc = docs.iter().find(|d| d.path == path).expect("doc");
            let content = store.read(path).expect("read");
            scan_document(
                doc,
                &content,
                &index_markdown(&content),
                &VaultLinkResolver::new(&docs),
                &ScanConfig::new(TagFilter::from_names(&["todo"]), true),
                &Tokenizer::default(),
            )
        }

        #[test]
        fn toggles_and_writes_once() {
            let store = MemoryStore::with(&[("a.md", 1, "#todo\n- [ ] buy milk\n- [x] call mom\n")]);
            let mut items = scan_one(&store, "a.md");

            let outcome = toggle_item(&mut items[0], &store).expect("toggle");
            assert_eq!(outcome, ToggleOutcome::Toggled { checked: true });
            assert!(items[0].checked);
            assert_eq!(store.content("a.md"), "#todo\n- [x] buy milk\n- [x] call mom\n");

            toggle_item(&mut items[1], &store).expect("toggle");
            assert_eq!(store.content("a.md"), "#todo\n- [x] buy milk\n- [ ] call mom\n");
            assert_eq!(store.writes(), 2);
        }

        #[test]
        fn stale_line_is_left_untouched() {
            let store = MemoryStore::with(&[("a.md", 1, "#todo\n- [ ] buy milk\n")]);
            let mut items = scan_one(&store, "a.md");
            let edited = "#todo\n- [ ] buy oat milk\n- [ ] buy milk\n";
            store.set_content("a.md", edited);

            let outcome = toggle_item(&mut items[0], &store).expect("toggle");
            assert_eq!(outcome, ToggleOutcome::Stale);
            assert!(!items[0].checked);
            assert_eq!(store.content("a.md"), edited);
            assert_eq!(store.writes(), 0);
        }

        #[test]
        fn truncated_file_is_stale() {
            let store = MemoryStore::with(&[("a.md", 1, "#todo\n\n- [ ] a\n")]);
            let mut items = scan_one(&store, "a.md");
            store.set_content("a.md", "#todo\n");
            assert_eq!(
                toggle_item(&mut items[0], &store).expect("toggle"),
                ToggleOutcome::Stale
            );
            assert_eq!(store.content("a.md"), "#todo\n");
        }

        #[test]
        fn toggling_twice_restores_the_original() {
            let original = "intro\n#todo\n  > - [ ] **bold** task\nend";
            let store = MemoryStore::with(&[("a.md", 1, original)]);

            let mut items = scan_one(&store, "a.md");
            toggle_item(&mut items[0], &store).expect("first toggle");
            assert_eq!(store.content("a.md"), "intro\n#todo\n  > - [x] **bold** task\nend");

            let mut rescanned = scan_one(&store, "a.md");
            assert!(rescanned[0].checked);
            toggle_item(&mut rescanned[0], &store).expect("second toggle");
            assert!(!rescanned[0].checked);
            assert_eq!(store.content("a.md"), original);
        }

        #[test]
        fn tag_in_the_middle_of_the_text_still_toggles() {
            let store = MemoryStore::with(&[("a.md", 1, "- [ ] buy #todo milk\n")]);
            let mut items = scan_one(&store, "a.md");
            assert_eq!(items[0].original_text, "buy milk");

            let outcome = toggle_item(&mut items[0], &store).expect("toggle");
            assert_eq!(outcome, ToggleOutcome::Toggled { checked: true });
            assert_eq!(store.content("a.md"), "- [x] buy #todo milk\n");
        }

        #[test]
        fn keeps_crlf_line_endings() {
            let store = MemoryStore::with(&[("a.md", 1, "#todo\r\n- [ ] a\r\n")]);
            let mut items = scan_one(&store, "a.md");
            toggle_item(&mut items[0], &store).expect("toggle");
            assert_eq!(store.content("a.md"), "#todo\r\n- [x] a\r\n");
        }

        #[test]
        fn read_failures_surface_as_errors_without_flipping() {
            let store = MemoryStore::with(&[("a.md", 1, "#todo\n- [ ] a\n")]);
            let mut items = scan_one(&store, "a.md");
            store.fail_reads_for("a.md");
            let err = toggle_item(&mut items[0], &store).unwrap_err();
            assert!(matches!(err, ToggleError::Read { .. }));
            assert!(!items[0].checked);
        }

        #[test]
        fn locked_toggle_uses_one_lock_per_path() {
            let locks = FileLocks::default();
            let a1 = locks.lock_for("a.md");
            let a2 = locks.lock_for("a.md");
            let b = locks.lock_for("b.md");
            assert!(Arc::ptr_eq(&a1, &a2));
            assert!(!Arc::ptr_eq(&a1, &b));

            let store = MemoryStore::with(&[("a.md", 1, "#todo\n- [ ] a\n")]);
            let mut items = scan_one(&store, "a.md");
            assert_eq!(
                locks.toggle(&mut items[0], &store).expect("toggle"),
                ToggleOutcome::Toggled { checked: true }
            );
        }

        #[test]
        fn finished_toggles_release_their_lock_entry() {
            let locks = FileLocks::default();
            let store = MemoryStore::with(&[("a.md", 1, "#todo\n- [ ] a\n- [ ] b\n")]);
            let mut items = scan_one(&store, "a.md");

            let held = locks.lock_for("a.md");
            locks.toggle(&mut items[0], &store).expect("toggle while held");
            assert_eq!(locks.tracked_paths(), 1);

            drop(held);
            locks.toggle(&mut items[1], &store).expect("toggle");
            assert_eq!(locks.tracked_paths(), 0);
            assert_eq!(store.content("a.md"), "#todo\n- [x] a\n- [x] b\n");
        }
    }
}

pub mod session {
    //! In-memory incremental cache of todo items, keyed by file path.
    //!
    //! Each refresh rescans only documents modified since the previous pass; a
    //! change of settings forces a full rescan. Nothing is persisted.

    use crate::core::{TodoGroup, TodoItem};
    use crate::grouping::{GroupOptions, group_with};
    use crate::links::VaultLinkResolver;
    use crate::scanner::{ScanConfig, ScanOptions, ScanRequest, ScanWarning, dedupe, scan_documents};
    use crate::settings::{Settings, SettingsError};
    use crate::storage::{DocumentStore, MetadataIndex};
    use crate::toggle::{FileLocks, ToggleError, ToggleOutcome};
    use chrono::Utc;
    use indexmap::IndexMap;

    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct RefreshSummary {
        pub scanned: usize,
        pub removed: usize,
        pub full: bool,
        pub warnings: Vec<ScanWarning>,
    }

    impl RefreshSummary {
        pub fn changed(&self) -> bool {
            self.scanned > 0 || self.removed > 0
        }
    }

    #[derive(Debug, Default)]
    pub struct TodoIndex {
        files: IndexMap<String, Vec<TodoItem>>,
        last_scan_ts: Option<i64>,
        settings: Option<Settings>,
        locks: FileLocks,
    }

    impl TodoIndex {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn refresh(
            &mut self,
            store: &dyn DocumentStore,
            index: &dyn MetadataIndex,
            settings: &Settings,
            options: &ScanOptions,
        ) -> Result<RefreshSummary, SettingsError> {
            let config = ScanConfig::from_settings(settings)?;
            let started = Utc::now().timestamp_millis();
            let full = self.last_scan_ts.is_none() || self.settings.as_ref() != Some(settings);

            let docs = match store.documents() {
                Ok(docs) => docs,
                Err(err) => {
                    return Ok(RefreshSummary {
                        full,
                        warnings: vec![ScanWarning {
                            path: String::new(),
                            message: format!("listing documents: {err:#}"),
                        }],
                        ..RefreshSummary::default()
                    });
                }
            };

            let previous = std::mem::take(&mut self.files);
            let last_scan = self.last_scan_ts;
            let stale: Vec<String> = docs
                .iter()
                .filter(|d| {
                    full
                        || !previous.contains_key(&d.path)
                        || last_scan.is_none_or(|ts| d.modified_ts >= ts)
                })
                .map(|d| d.path.clone())
                .collect();
            let request = ScanRequest {
                files: Some(stale),
                modified_since: None,
            };
            if options.verbose {
                eprintln!(
                    "Refreshing {} document(s) ({})",
                    docs.len(),
                    if full { "full" } else { "incremental" }
                );
            }
            let resolver = VaultLinkResolver::new(&docs);
            let mut report = scan_documents(&docs, store, index, &resolver, &config, &request, options);
            let scanned = report.by_file.len();

            let keep_previous = !full || report.cancelled;
            let mut files = IndexMap::new();
            for doc in &docs {
                if let Some(items) = report.by_file.shift_remove(&doc.path) {
                    files.insert(doc.path.clone(), items);
                } else if keep_previous {
                    if let Some(items) = previous.get(&doc.path) {
                        files.insert(doc.path.clone(), items.clone());
                    }
                }
            }
            let removed = previous.keys().filter(|p| !files.contains_key(*p)).count();

            self.files = files;
            if !report.cancelled {
                self.last_scan_ts = Some(started);
                self.settings = Some(settings.clone());
            }
            Ok(RefreshSummary {
                scanned,
                removed,
                full,
                warnings: report.warnings,
            })
        }

        /// All cached items, in document order.
        pub fn items(&self) -> Vec<TodoItem> {
            dedupe(self.files.values().flatten().cloned().collect())
        }

        pub fn items_for(&self, path: &str) -> &[TodoItem] {
            self.files.get(path).map(Vec::as_slice).unwrap_or(&[])
        }

        pub fn groups(&self, settings: &Settings) -> Vec<TodoGroup> {
            group_with(&self.items(), GroupOptions::from(settings))
        }

        /// Toggle the cached item at `path:line` and update it in place.
        pub fn toggle(
            &mut self,
            store: &dyn DocumentStore,
            path: &str,
            line: usize,
        ) -> Result<ToggleOutcome, ToggleError> {
            let item = self
                .files
                .get_mut(path)
                .and_then(|items| items.iter_mut().find(|i| i.line == line))
                .ok_or_else(|| ToggleError::NotFound {
                    path: path.to_string(),
                    line,
                })?;
            self.locks.toggle(item, store)
        }
    }

}

pub mod format {
    //! Rendering display trees as plain text, terminal text, or HTML.

    use crate::core::DisplayChunk;

    pub fn plain_text(chunks: &[DisplayChunk]) -> String {
        fn rec(xs: &[DisplayChunk], out: &mut String) {
            for x in xs {
                match x {
                    DisplayChunk::Text { value } => out.push_str(value),
                    DisplayChunk::Bold { children }
                    | DisplayChunk::Italic { children }
                    | DisplayChunk::Link { children, .. } => rec(children, out),
                }
            }
        }
        let mut s = String::new();
        rec(chunks, &mut s);
        s
    }

    /// Markdown-ish text for terminals: `**bold**`, `*italic*`, `label <path>`.
    pub fn to_terminal(chunks: &[DisplayChunk]) -> String {
        let mut out = String::new();
        for chunk in chunks {
            match chunk {
                DisplayChunk::Text { value } => out.push_str(value),
                DisplayChunk::Bold { children } => {
                    out.push_str("**");
                    out.push_str(&to_terminal(children));
                    out.push_str("**");
                }
                DisplayChunk::Italic { children } => {
                    out.push('*');
                    out.push_str(&to_terminal(children));
                    out.push('*');
                }
                DisplayChunk::Link {
                    children,
                    target_path,
                    ..
                } => {
                    out.push_str(&to_terminal(children));
                    out.push_str(" <");
                    out.push_str(target_path);
                    out.push('>');
                }
            }
        }
        out
    }

    pub fn to_html(chunks: &[DisplayChunk]) -> String {
        let mut out = String::new();
        for chunk in chunks {
            match chunk {
                DisplayChunk::Text { value } => out.push_str(&escape(value)),
                DisplayChunk::Bold { children } => {
                    out.push_str("<strong>");
                    out.push_str(&to_html(children));
                    out.push_str("</strong>");
                }
                DisplayChunk::Italic { children } => {
                    out.push_str("<em>");
                    out.push_str(&to_html(children));
                    out.push_str("</em>");
                }
                DisplayChunk::Link {
                    children,
                    target_path,
                    label,
                } => {
                    out.push_str(&format!(
                        r#"<a data-href="{}" data-type="link" data-filepath="{}" class="internal-link">"#,
                        escape(label),
                        escape(target_path)
                    ));
                    out.push_str(&to_html(children));
                    out.push_str("</a>");
                }
            }
        }
        out
    }

    pub fn escape(s: &str) -> String {
        let mut out = String::with_capacity(s.len());
        for c in s.chars() {
            match c {
                '&' => out.push_str("&amp;"),
                '"' => out.push_str("&quot;"),
                '\'' => out.push_str("&#39;"),
                '<' => out.push_str("&lt;"),
                '>' => out.push_str("&gt;"),
                _ => out.push(c),
            }
        }
        out
    }

    /// CSS-safe class for a group name: ASCII alphanumerics, first letter lower-cased.
    pub fn group_class_name(name: &str) -> String {
        let mut chars = name.chars().filter(char::is_ascii_alphanumeric);
        match chars.next() {
            Some(first) => first.to_ascii_lowercase().to_string() + &chars.collect::<String>(),
            None => String::new(),
        }
    }

}


pub use grouping::group_todos;
pub use markup::{Tokenizer, decorate, tokenize};
pub use scanner::{ScanConfig, ScanOptions, ScanReport, ScanRequest, scan, scan_document};
pub use session::TodoIndex;
pub use settings::Settings;
pub use tags::resolve;
pub use toggle::{ToggleOutcome, toggle_item};
