//! Chat document domain library.
//! The core is the lossless, idempotent transform between the in-memory
//! `Document` aggregate and its flat markdown representation: frontmatter
//! metadata, an Inbox of triage cards, an ordered ChatHistory, and a
//! Workspace of file references. Rendering, reordering UIs, file watching,
//! and completion calls are external collaborators that go through
//! `parse`/`serialize` and never carry parsing logic of their own.

pub mod core {
    use crate::tokens::{self, InlineTokens};
    use chrono::Utc;
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use std::path::PathBuf;
    use uuid::Uuid;

    /* ------------------------------- IDs ------------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct DocumentId(pub Uuid);

    impl DocumentId {
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }
    }

    /// Card identifier. Stored as text so an id embedded in source survives
    /// a parse/serialize cycle verbatim; fresh values embed a v4 UUID.
    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct CardId(pub String);

    impl CardId {
        pub fn new() -> Self {
            Self(format!("card-{}", Uuid::new_v4()))
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct MessageId(pub String);

    impl MessageId {
        pub fn new() -> Self {
            Self(format!("msg-{}", Uuid::new_v4()))
        }
    }

    pub(crate) fn now_millis() -> i64 {
        Utc::now().timestamp_millis()
    }

    /* ------------------------------ Aggregate ------------------------------ */

    /// Aggregate root: one chat document. Owns every nested structure
    /// exclusively; collaborators replace the whole value on re-parse
    /// (last write wins) rather than merging.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Document {
        /// In-memory identity; not part of the wire format.
        pub id: DocumentId,
        /// Optional filesystem path if the document originates from disk.
        pub path: Option<PathBuf>,
        pub metadata: Metadata,
        #[serde(default)]
        pub inbox: InboxSection,
        #[serde(default)]
        pub chat_history: ChatHistorySection,
        #[serde(default)]
        pub workspace: WorkspaceSection,
    }

    impl Document {
        pub fn new(path: Option<PathBuf>) -> Self {
            Self {
                id: DocumentId::new(),
                path,
                metadata: Metadata::new(now_millis()),
                inbox: InboxSection::default(),
                chat_history: ChatHistorySection::default(),
                workspace: WorkspaceSection::default(),
            }
        }

        /// Append a message; inline tokens in `content` populate the
        /// actions/references so the result matches a later re-parse.
        pub fn append_message(&mut self, role: Role, content: &str) -> MessageId {
            let toks = tokens::extract(content);
            let (actions, references) = semantics_from_tokens(&toks);
            let message = Message {
                id: MessageId::new(),
                role,
                content: content.trim().to_string(),
                timestamp: toks.timestamp.unwrap_or_else(now_millis),
                actions,
                references,
            };
            let id = message.id.clone();
            self.chat_history.messages.push(message);
            id
        }

        pub fn add_card(&mut self, content: &str) -> CardId {
            let content = content.trim().to_string();
            let card = Card {
                id: CardId::new(),
                kind: CardKind::infer(&content),
                content,
                metadata: None,
            };
            let id = card.id.clone();
            self.inbox.cards.push(card);
            id
        }

        pub fn add_workspace_reference(&mut self, path: &str) {
            let reference = WorkspaceReference {
                kind: WorkspaceKind::infer(path),
                path: path.trim().to_string(),
                metadata: None,
            };
            self.workspace.references.push(reference);
        }

        /// Triage a card out of the inbox: its content becomes a new user
        /// message at the end of the chat history.
        pub fn promote_card(&mut self, id: &CardId) -> Result<MessageId, DomainError> {
            let pos = self
                .inbox
                .cards
                .iter()
                .position(|card| &card.id == id)
                .ok_or_else(|| DomainError::UnknownCardId(id.0.clone()))?;
            let card = self.inbox.cards.remove(pos);
            Ok(self.append_message(Role::User, &card.content))
        }

        /// Replace the message sequence with a new ordering. The argument
        /// must be a permutation of the current ids; the list is left
        /// untouched on error.
        pub fn reorder_messages(&mut self, order: &[MessageId]) -> Result<(), DomainError> {
            let messages = &mut self.chat_history.messages;
            if order.len() != messages.len() {
                return Err(DomainError::OrderMismatch {
                    expected: messages.len(),
                    got: order.len(),
                });
            }
            let mut indices = Vec::with_capacity(order.len());
            for id in order {
                let pos = messages
                    .iter()
                    .position(|m| &m.id == id)
                    .ok_or_else(|| DomainError::UnknownMessageId(id.0.clone()))?;
                if indices.contains(&pos) {
                    return Err(DomainError::DuplicateOrderId(id.0.clone()));
                }
                indices.push(pos);
            }
            let mut slots: Vec<Option<Message>> = messages.drain(..).map(Some).collect();
            for pos in indices {
                if let Some(message) = slots[pos].take() {
                    messages.push(message);
                }
            }
            Ok(())
        }

        pub fn set_title(&mut self, title: &str) {
            self.metadata.title = title.trim().to_string();
        }
    }

    /* ------------------------------ Metadata ------------------------------ */

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Metadata {
        pub title: String,
        pub doc_type: DocType,
        /// Creation time, epoch milliseconds.
        pub timestamp: i64,
        /// Ordered; duplicates permitted, matching the source text literally.
        pub tags: Option<Vec<Tag>>,
    }

    impl Metadata {
        pub fn new(timestamp: i64) -> Self {
            Self {
                title: "New Chat".to_string(),
                doc_type: DocType::Chat,
                timestamp,
                tags: None,
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum DocType {
        Chat,
        Flow,
    }

    impl DocType {
        pub fn parse(s: &str) -> Option<Self> {
            match s {
                "chat" => Some(Self::Chat),
                "flow" => Some(Self::Flow),
                _ => None,
            }
        }

        pub fn as_str(&self) -> &'static str {
            match self {
                Self::Chat => "chat",
                Self::Flow => "flow",
            }
        }
    }

    /// Tag wrapper; kept verbatim from the source text.
    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct Tag(pub String);

    impl From<&str> for Tag {
        fn from(s: &str) -> Self {
            Self(s.to_string())
        }
    }

    /* ------------------------------- Inbox ------------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct InboxSection {
        /// Document order; rendered top to bottom.
        #[serde(default)]
        pub cards: Vec<Card>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Card {
        pub id: CardId,
        pub kind: CardKind,
        pub content: String,
        pub metadata: Option<CardMeta>,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum CardKind {
        Text,
        Url,
        Image,
    }

    impl CardKind {
        /// Kind is derived from the content itself so it survives a
        /// round trip without being written out.
        pub fn infer(content: &str) -> Self {
            if content.starts_with("http://") || content.starts_with("https://") {
                Self::Url
            } else if content.starts_with("![") {
                Self::Image
            } else {
                Self::Text
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct CardMeta {
        pub created: Option<i64>,
        pub source: Option<String>,
        pub preview: Option<UrlPreview>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct UrlPreview {
        pub title: String,
        pub description: String,
        pub thumbnail: Option<String>,
    }

    /* ----------------------------- Chat history ----------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct ChatHistorySection {
        /// Chronological and on-disk order; there is no separate sort key.
        #[serde(default)]
        pub messages: Vec<Message>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Message {
        pub id: MessageId,
        pub role: Role,
        pub content: String,
        /// Epoch milliseconds.
        pub timestamp: i64,
        #[serde(default)]
        pub actions: Vec<Action>,
        #[serde(default)]
        pub references: Vec<Reference>,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum Role {
        User,
        System,
        Agent,
    }

    impl Role {
        pub fn parse(s: &str) -> Option<Self> {
            if s.eq_ignore_ascii_case("user") {
                Some(Self::User)
            } else if s.eq_ignore_ascii_case("system") {
                Some(Self::System)
            } else if s.eq_ignore_ascii_case("agent") {
                Some(Self::Agent)
            } else {
                None
            }
        }

        /// Capitalized form used in entry headers.
        pub fn heading(&self) -> &'static str {
            match self {
                Self::User => "User",
                Self::System => "System",
                Self::Agent => "Agent",
            }
        }
    }

    /// A structured instruction or result captured from message text.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Action {
        pub kind: ActionKind,
        pub params: IndexMap<String, String>,
        pub result: Option<String>,
    }

    impl Action {
        /// The token's bracketed value lands under the `value` key.
        /// Unrecognized kinds fall under the malformed-token policy and
        /// yield no action.
        pub fn from_token(kind: &str, value: &str) -> Option<Self> {
            let kind = ActionKind::parse(kind)?;
            let mut params = IndexMap::new();
            params.insert("value".to_string(), value.to_string());
            Some(Self {
                kind,
                params,
                result: None,
            })
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum ActionKind {
        #[serde(rename = "get")]
        Get,
        #[serde(rename = "search")]
        Search,
        #[serde(rename = "fileRead")]
        FileRead,
        #[serde(rename = "think")]
        Think,
    }

    impl ActionKind {
        pub fn parse(s: &str) -> Option<Self> {
            match s {
                "get" => Some(Self::Get),
                "search" => Some(Self::Search),
                "fileRead" => Some(Self::FileRead),
                "think" => Some(Self::Think),
                _ => None,
            }
        }

        pub fn as_str(&self) -> &'static str {
            match self {
                Self::Get => "get",
                Self::Search => "search",
                Self::FileRead => "fileRead",
                Self::Think => "think",
            }
        }
    }

    /// A pointer to an external file or link captured from text.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Reference {
        pub kind: RefKind,
        pub path: String,
        pub excerpt: Option<String>,
    }

    impl Reference {
        pub fn from_path(path: &str) -> Self {
            let kind = if path.starts_with("http://") || path.starts_with("https://") {
                RefKind::Link
            } else {
                RefKind::File
            };
            Self {
                kind,
                path: path.to_string(),
                excerpt: None,
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum RefKind {
        File,
        Link,
    }

    /// Map raw inline tokens onto typed actions and references, in
    /// appearance order. Duplicate references stay duplicated to preserve
    /// citation count.
    pub fn semantics_from_tokens(toks: &InlineTokens) -> (Vec<Action>, Vec<Reference>) {
        let actions = toks
            .actions
            .iter()
            .filter_map(|t| Action::from_token(&t.kind, &t.value))
            .collect();
        let references = toks
            .references
            .iter()
            .map(|path| Reference::from_path(path))
            .collect();
        (actions, references)
    }

    /* ------------------------------ Workspace ------------------------------ */

    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct WorkspaceSection {
        #[serde(default)]
        pub references: Vec<WorkspaceReference>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct WorkspaceReference {
        pub kind: WorkspaceKind,
        pub path: String,
        pub metadata: Option<WorkspaceMeta>,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum WorkspaceKind {
        File,
        Image,
        Pdf,
    }

    impl WorkspaceKind {
        pub fn infer(path: &str) -> Self {
            let ext = path
                .rsplit_once('.')
                .map(|(_, ext)| ext.to_ascii_lowercase())
                .unwrap_or_default();
            match ext.as_str() {
                "png" | "jpg" | "jpeg" | "gif" | "webp" => Self::Image,
                "pdf" => Self::Pdf,
                _ => Self::File,
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct WorkspaceMeta {
        /// Epoch milliseconds; absent when the host never touched the entry.
        pub last_accessed: Option<i64>,
        #[serde(default)]
        pub excerpts: Vec<String>,
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, thiserror::Error)]
    pub enum DomainError {
        #[error("unknown card id {0:?}")]
        UnknownCardId(String),
        #[error("unknown message id {0:?}")]
        UnknownMessageId(String),
        #[error("message id {0:?} appears twice in the requested order")]
        DuplicateOrderId(String),
        #[error("order lists {got} messages, document has {expected}")]
        OrderMismatch { expected: usize, got: usize },
    }

}

pub mod tokens {
    //! Inline token extraction: the lexical layer under the section parsers
    //! and the document mutation ops. Pure functions of the input text;
    //! malformed tokens are simply not matched, never an error.
    //!
    //! Recognized tokens:
    //! - action lines: `> [<kind>]: [<value>]`
    //! - references: `[[<path>]]`
    //! - markers: `{timestamp: <integer>}` and `{id: <token>}` (first wins)

    use nom::{
        IResult,
        bytes::complete::{tag, take_until, take_while1},
        character::complete::{char, digit1, space0},
        combinator::{map_res, opt, recognize},
        error::VerboseError,
        sequence::tuple,
    };

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /// One `> [kind]: [value]` line, both parts trimmed.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ActionToken {
        pub kind: String,
        pub value: String,
    }

    /// Everything the extractor recognizes in one block of text.
    #[derive(Debug, Clone, PartialEq, Eq, Default)]
    pub struct InlineTokens {
        pub actions: Vec<ActionToken>,
        pub references: Vec<String>,
        pub timestamp: Option<i64>,
        pub id: Option<String>,
    }

    pub fn extract(text: &str) -> InlineTokens {
        InlineTokens {
            actions: scan_actions(text),
            references: scan_references(text),
            timestamp: first_timestamp(text),
            id: first_id(text),
        }
    }

    /* ------------------------------- Actions ------------------------------- */

    fn scan_actions(text: &str) -> Vec<ActionToken> {
        let mut out = Vec::new();
        for line in text.lines() {
            if let Ok((rest, token)) = action_line(line.trim()) {
                // the pair of bracketed tokens must be the whole line
                if rest.trim().is_empty() {
                    out.push(token);
                }
            }
        }
        out
    }

    fn action_line(i: &str) -> PResult<'_, ActionToken> {
        let (i, _) = char('>')(i)?;
        let (i, _) = space0(i)?;
        let (i, _) = char('[')(i)?;
        let (i, kind) = take_until("]")(i)?;
        let (i, _) = char(']')(i)?;
        let (i, _) = char(':')(i)?;
        let (i, _) = space0(i)?;
        let (i, _) = char('[')(i)?;
        let (i, value) = take_until("]")(i)?;
        let (i, _) = char(']')(i)?;
        Ok((
            i,
            ActionToken {
                kind: kind.trim().to_string(),
                value: value.trim().to_string(),
            },
        ))
    }

    /* ----------------------------- References ----------------------------- */

    fn scan_references(text: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut rest = text;
        while let Some(start) = rest.find("[[") {
            match reference(&rest[start..]) {
                Ok((after, path)) => {
                    let path = path.trim();
                    if path.is_empty() || path.contains("[[") {
                        // empty or nested opener: treat this `[[` as plain
                        // text and rescan right after it
                        rest = &rest[start + 2..];
                    } else {
                        out.push(path.to_string());
                        rest = after;
                    }
                }
                // unterminated; nothing further can match
                Err(_) => break,
            }
        }
        out
    }

    fn reference(i: &str) -> PResult<'_, &str> {
        let (i, _) = tag("[[")(i)?;
        let (i, path) = take_until("]]")(i)?;
        let (i, _) = tag("]]")(i)?;
        Ok((i, path))
    }

    /* ------------------------------- Markers ------------------------------- */

    fn first_timestamp(text: &str) -> Option<i64> {
        for (pos, ch) in text.char_indices() {
            if ch == '{' {
                if let Ok((_, value)) = timestamp_marker(&text[pos..]) {
                    return Some(value);
                }
            }
        }
        None
    }

    fn first_id(text: &str) -> Option<String> {
        for (pos, ch) in text.char_indices() {
            if ch == '{' {
                if let Ok((_, value)) = id_marker(&text[pos..]) {
                    return Some(value.to_string());
                }
            }
        }
        None
    }

    fn timestamp_marker(i: &str) -> PResult<'_, i64> {
        let (i, _) = tag("{timestamp:")(i)?;
        let (i, _) = space0(i)?;
        let (i, value) = map_res(
            recognize(tuple((opt(char('-')), digit1))),
            str::parse::<i64>,
        )(i)?;
        let (i, _) = space0(i)?;
        let (i, _) = char('}')(i)?;
        Ok((i, value))
    }

    fn id_marker(i: &str) -> PResult<'_, &str> {
        let (i, _) = tag("{id:")(i)?;
        let (i, _) = space0(i)?;
        let (i, value) = take_while1(|c: char| !c.is_whitespace() && c != '}' && c != '{')(i)?;
        let (i, _) = space0(i)?;
        let (i, _) = char('}')(i)?;
        Ok((i, value))
    }

    /// Remove id/timestamp markers from a single line, for lines where the
    /// surrounding text is data (e.g. a workspace path line).
    pub fn strip_markers(line: &str) -> String {
        let mut out = String::with_capacity(line.len());
        let mut rest = line;
        while let Some(ch) = rest.chars().next() {
            if ch == '{' {
                if let Ok((after, _)) = timestamp_marker(rest) {
                    rest = after;
                    continue;
                }
                if let Ok((after, _)) = id_marker(rest) {
                    rest = after;
                    continue;
                }
            }
            out.push(ch);
            rest = &rest[ch.len_utf8()..];
        }
        out.trim().to_string()
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn extracts_action_lines_in_order() {
            let text = "intro\n> [search]: [budget report]\nmiddle\n> [get]: [x]\n";
            let toks = extract(text);
            assert_eq!(toks.actions.len(), 2);
            assert_eq!(toks.actions[0].kind, "search");
            assert_eq!(toks.actions[0].value, "budget report");
            assert_eq!(toks.actions[1].kind, "get");
        }

        #[test]
        fn action_must_fill_the_whole_line() {
            let toks = extract("> [search]: [x] trailing words\n");
            assert!(toks.actions.is_empty());
        }

        #[test]
        fn keeps_duplicate_references() {
            let toks = extract("see [[a.md]] and [[a.md]] plus [[b.md]]");
            assert_eq!(toks.references, vec!["a.md", "a.md", "b.md"]);
        }

        #[test]
        fn unterminated_reference_matches_nothing() {
            let toks = extract("broken [[unterminated");
            assert!(toks.references.is_empty());
        }

        #[test]
        fn nested_opener_is_skipped_but_inner_still_matches() {
            let toks = extract("odd [[a[[b.md]] tail");
            assert_eq!(toks.references, vec!["b.md"]);
        }

        #[test]
        fn first_timestamp_marker_wins() {
            let toks = extract("x {timestamp: 42} y {timestamp: 43}");
            assert_eq!(toks.timestamp, Some(42));
        }

        #[test]
        fn malformed_timestamp_is_ignored() {
            assert_eq!(extract("{timestamp: soon}").timestamp, None);
            assert_eq!(extract("{timestamp: 42").timestamp, None);
        }

        #[test]
        fn id_marker_round_trips_verbatim() {
            let toks = extract("### User {id: msg-7f3a} {timestamp: 9}");
            assert_eq!(toks.id.as_deref(), Some("msg-7f3a"));
            assert_eq!(toks.timestamp, Some(9));
        }

        #[test]
        fn strip_markers_leaves_plain_text() {
            assert_eq!(strip_markers("note.md {timestamp: 5}"), "note.md");
            assert_eq!(strip_markers("note.md"), "note.md");
            assert_eq!(strip_markers("{id: x} note.md"), "note.md");
        }
    }
}

pub mod storage {
    //! Persistence seams. Parsing is independent of where the bytes come
    //! from, so the traits are split the same way: a parser over paths and
    //! a store that also writes.

    use super::core::Document;
    use anyhow::{Context, Result};
    use std::fs;
    use std::path::{Path, PathBuf};

    pub trait DocumentParser {
        fn parse_file(&self, abs_path: &Path) -> Result<Document>;
    }

    pub trait DocumentStore {
        fn load(&self, path: &Path) -> Result<Document>;
        fn save(&self, doc: &Document, path: &Path) -> Result<()>;
    }

    /// Filesystem store: read + parse on load, serialize + atomic rename
    /// on save so a watching host never observes a half-written file.
    pub struct FsDocumentStore;

    impl DocumentStore for FsDocumentStore {
        fn load(&self, path: &Path) -> Result<Document> {
            let text = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
            Ok(crate::parser::parse_document_from_str(
                Some(path.to_path_buf()),
                &text,
            ))
        }

        fn save(&self, doc: &Document, path: &Path) -> Result<()> {
            let text = crate::format::serialize_document(doc)
                .with_context(|| format!("serializing document for {:?}", path))?;
            let mut tmp_name = path.as_os_str().to_owned();
            tmp_name.push(".tmp");
            let tmp = PathBuf::from(tmp_name);
            fs::write(&tmp, text.as_bytes()).with_context(|| format!("writing {:?}", tmp))?;
            fs::rename(&tmp, path)
                .with_context(|| format!("renaming {:?} into place", tmp))?;
            Ok(())
        }
    }

}

pub mod parser {
    //! Markdown chat-document parser.
    //!
    //! Tolerant by contract: input text never fails to parse. A malformed
    //! stage degrades to its default value and the rest of the document
    //! still parses; only filesystem reads are fallible. Block boundaries
    //! come from one line-oriented pass (no positional re-scanning), and
    //! inline tokens come from `crate::tokens`.

    use crate::core::*;
    use crate::storage::DocumentParser;
    use crate::tokens;
    use anyhow::{Context, Result};
    use nom::{
        IResult,
        bytes::complete::take_while1,
        character::complete::{char, space0},
        combinator::{map, rest},
        error::VerboseError,
        sequence::tuple,
    };
    use std::{fs, path::Path, path::PathBuf};

    /* ------------------------ Public entry points ------------------------ */

    /// Parse a chat document from a string. Total: any input yields a
    /// `Document`, with unparsable stages degraded to their defaults.
    pub fn parse_document_from_str(path: Option<PathBuf>, input: &str) -> Document {
        let split = split_document(input);
        let mut doc = Document::new(path);
        doc.metadata = parse_frontmatter(&split.frontmatter);
        for (name, block) in &split.sections {
            match name {
                SectionName::Inbox => doc.inbox = parse_inbox(block),
                SectionName::ChatHistory => doc.chat_history = parse_chat_history(block),
                SectionName::Workspace => doc.workspace = parse_workspace(block),
            }
        }
        doc
    }

    /// Concrete parser implementing the `storage::DocumentParser` trait.
    pub struct MarkdownDocumentParser;

    impl DocumentParser for MarkdownDocumentParser {
        fn parse_file(&self, abs_path: &Path) -> Result<Document> {
            let text =
                fs::read_to_string(abs_path).with_context(|| format!("reading {:?}", abs_path))?;
            Ok(parse_document_from_str(Some(abs_path.to_path_buf()), &text))
        }
    }

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /* --------------------------- Section splitting --------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum SectionName {
        Inbox,
        ChatHistory,
        Workspace,
    }

    impl SectionName {
        // canonical spellings; other variants are a migration concern
        fn parse(s: &str) -> Option<Self> {
            match s {
                "Inbox" => Some(Self::Inbox),
                "ChatHistory" => Some(Self::ChatHistory),
                "Workspace" => Some(Self::Workspace),
                _ => None,
            }
        }
    }

    struct SplitDocument {
        frontmatter: String,
        sections: Vec<(SectionName, String)>,
    }

    /// One pass over the lines: an optional leading `---` frontmatter
    /// block, then `## Name` headers opening blocks that run to the next
    /// header of the same or higher level. Unrecognized sections are
    /// dropped. Without a leading delimiter the whole text is body.
    fn split_document(input: &str) -> SplitDocument {
        let all: Vec<&str> = input.lines().collect();
        let mut idx = 0;
        let mut frontmatter: &[&str] = &[];
        if all.first().map(|l| l.trim() == "---").unwrap_or(false) {
            if let Some(close) = all.iter().skip(1).position(|l| l.trim() == "---") {
                frontmatter = &all[1..close + 1];
                idx = close + 2;
            }
        }

        let mut sections: Vec<(SectionName, Vec<&str>)> = Vec::new();
        let mut current: Option<usize> = None;
        for &line in &all[idx..] {
            if let Some(name) = line.strip_prefix("## ").and_then(|r| SectionName::parse(r.trim()))
            {
                sections.push((name, Vec::new()));
                current = Some(sections.len() - 1);
                continue;
            }
            if line.starts_with("## ") || line.starts_with("# ") {
                // unrecognized or higher-level header closes the section
                current = None;
                continue;
            }
            if let Some(slot) = current {
                sections[slot].1.push(line);
            }
        }

        SplitDocument {
            frontmatter: frontmatter.join("\n"),
            sections: sections
                .into_iter()
                .map(|(name, lines)| (name, lines.join("\n")))
                .collect(),
        }
    }

    fn split_paragraphs(block: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut current: Vec<&str> = Vec::new();
        for line in block.lines() {
            if line.trim().is_empty() {
                if !current.is_empty() {
                    out.push(current.join("\n"));
                    current.clear();
                }
            } else {
                current.push(line);
            }
        }
        if !current.is_empty() {
            out.push(current.join("\n"));
        }
        out
    }

    /* ----------------------------- Frontmatter ----------------------------- */

    fn parse_frontmatter(block: &str) -> Metadata {
        let mut meta = Metadata::new(now_millis());
        for line in block.lines() {
            let Ok((_, (key, value))) = frontmatter_line(line) else {
                continue;
            };
            match key {
                "title" => meta.title = value.trim().to_string(),
                "type" => {
                    if let Some(doc_type) = DocType::parse(value.trim()) {
                        meta.doc_type = doc_type;
                    }
                }
                "timestamp" => {
                    if let Ok(ts) = value.trim().parse::<i64>() {
                        meta.timestamp = ts;
                    }
                }
                "tags" => {
                    meta.tags = Some(
                        value
                            .split(',')
                            .map(|t| Tag(t.trim().to_string()))
                            .filter(|t| !t.0.is_empty())
                            .collect(),
                    );
                }
                _ => {}
            }
        }
        meta
    }

    fn frontmatter_line(i: &str) -> PResult<'_, (&str, &str)> {
        map(
            tuple((
                take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_'),
                char(':'),
                space0,
                rest,
            )),
            |(key, _, _, value): (&str, char, &str, &str)| (key, value),
        )(i)
    }

    /* -------------------------------- Inbox -------------------------------- */

    struct RawEntry<'a> {
        marker_line: &'a str,
        body: Vec<&'a str>,
    }

    fn parse_inbox(block: &str) -> InboxSection {
        let mut entries: Vec<RawEntry<'_>> = Vec::new();
        for line in block.lines() {
            if match_card_header(line) {
                entries.push(RawEntry {
                    marker_line: line,
                    body: Vec::new(),
                });
            } else if let Some(entry) = entries.last_mut() {
                entry.body.push(line);
            }
        }

        if entries.is_empty() {
            return parse_inbox_paragraphs(block);
        }

        InboxSection {
            cards: entries.into_iter().filter_map(card_from_entry).collect(),
        }
    }

    fn match_card_header(line: &str) -> bool {
        line.strip_prefix("### ")
            .map(|rest| rest.trim_start().starts_with("Card"))
            .unwrap_or(false)
    }

    fn card_from_entry(entry: RawEntry<'_>) -> Option<Card> {
        let marker = tokens::extract(entry.marker_line);

        let mut content_lines: Vec<&str> = Vec::new();
        let mut source = None;
        let mut title = None;
        let mut description = None;
        let mut thumbnail = None;
        let mut in_meta = false;
        for line in entry.body {
            if let Some(v) = line.strip_prefix("source:") {
                source = Some(v.trim().to_string());
                in_meta = true;
            } else if let Some(v) = line.strip_prefix("title:") {
                title = Some(v.trim().to_string());
                in_meta = true;
            } else if let Some(v) = line.strip_prefix("description:") {
                description = Some(v.trim().to_string());
                in_meta = true;
            } else if let Some(v) = line.strip_prefix("thumbnail:") {
                thumbnail = Some(v.trim().to_string());
                in_meta = true;
            } else if !in_meta {
                content_lines.push(line);
            }
        }

        let content = content_lines.join("\n").trim().to_string();
        if content.is_empty() {
            return None;
        }

        let preview = if title.is_some() || description.is_some() || thumbnail.is_some() {
            Some(UrlPreview {
                title: title.unwrap_or_default(),
                description: description.unwrap_or_default(),
                thumbnail,
            })
        } else {
            None
        };
        let metadata = if marker.timestamp.is_some() || source.is_some() || preview.is_some() {
            Some(CardMeta {
                created: marker.timestamp,
                source,
                preview,
            })
        } else {
            None
        };

        Some(Card {
            id: marker.id.map(CardId).unwrap_or_else(CardId::new),
            kind: CardKind::infer(&content),
            content,
            metadata,
        })
    }

    /// Degraded input without `### Card` headers: every paragraph is a
    /// text card with a fresh id.
    fn parse_inbox_paragraphs(block: &str) -> InboxSection {
        let mut cards = Vec::new();
        for para in split_paragraphs(block) {
            let content = para.trim().to_string();
            if content.is_empty() {
                continue;
            }
            cards.push(Card {
                id: CardId::new(),
                kind: CardKind::infer(&content),
                content,
                metadata: None,
            });
        }
        InboxSection { cards }
    }

    /* ----------------------------- Chat history ----------------------------- */

    struct RawMessage<'a> {
        role: Role,
        marker_line: &'a str,
        /// Set for the inline `Role: ...` form; the rest of the marker line.
        inline_rest: Option<&'a str>,
        body: Vec<&'a str>,
    }

    fn parse_chat_history(block: &str) -> ChatHistorySection {
        let mut entries: Vec<RawMessage<'_>> = Vec::new();
        for line in block.lines() {
            if let Some(role) = match_role_header(line) {
                entries.push(RawMessage {
                    role,
                    marker_line: line,
                    inline_rest: None,
                    body: Vec::new(),
                });
            } else if let Some((role, inline_rest)) = match_inline_role(line) {
                entries.push(RawMessage {
                    role,
                    marker_line: line,
                    inline_rest: Some(inline_rest),
                    body: Vec::new(),
                });
            } else if let Some(entry) = entries.last_mut() {
                entry.body.push(line);
            }
        }

        ChatHistorySection {
            messages: entries.into_iter().map(message_from_entry).collect(),
        }
    }

    fn match_role_header(line: &str) -> Option<Role> {
        let rest = line.strip_prefix("### ")?.trim_start();
        let word = rest.split_whitespace().next().unwrap_or("");
        Role::parse(word)
    }

    fn match_inline_role(line: &str) -> Option<(Role, &str)> {
        let (head, rest) = line.split_once(':')?;
        let role = Role::parse(head.trim())?;
        Some((role, rest))
    }

    fn message_from_entry(entry: RawMessage<'_>) -> Message {
        let mut content_lines: Vec<&str> = Vec::new();
        if let Some(first) = entry.inline_rest {
            content_lines.push(first.trim_start());
        }
        content_lines.extend(entry.body.iter().copied());
        let content = content_lines.join("\n").trim().to_string();

        // id and timestamp prefer the marker line (where the writer puts
        // them); actions/references always come from the content so the
        // original token lines stay in it unmodified.
        let marker = tokens::extract(entry.marker_line);
        let body_tokens = tokens::extract(&content);
        let (actions, references) = semantics_from_tokens(&body_tokens);

        Message {
            id: marker
                .id
                .or(body_tokens.id)
                .map(MessageId)
                .unwrap_or_else(MessageId::new),
            role: entry.role,
            content,
            timestamp: marker
                .timestamp
                .or(body_tokens.timestamp)
                .unwrap_or_else(now_millis),
            actions,
            references,
        }
    }

    /* ------------------------------ Workspace ------------------------------ */

    fn parse_workspace(block: &str) -> WorkspaceSection {
        let mut references = Vec::new();
        for para in split_paragraphs(block) {
            let mut lines = para.lines();
            let Some(first) = lines.next() else {
                continue;
            };
            let toks = tokens::extract(first);
            let path = tokens::strip_markers(first);
            if path.is_empty() {
                continue;
            }
            let excerpts: Vec<String> = lines.map(|l| l.to_string()).collect();
            let metadata = if toks.timestamp.is_some() || !excerpts.is_empty() {
                Some(WorkspaceMeta {
                    last_accessed: toks.timestamp,
                    excerpts,
                })
            } else {
                None
            };
            references.push(WorkspaceReference {
                kind: WorkspaceKind::infer(&path),
                path,
                metadata,
            });
        }
        WorkspaceSection { references }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn parses_the_demo_document() {
            let input = r#"---
title: Demo
---

## ChatHistory

User: Hello [[note.md]]

## Workspace

note.md
"#;
            let doc = parse_document_from_str(None, input);
            assert_eq!(doc.metadata.title, "Demo");
            assert_eq!(doc.chat_history.messages.len(), 1);
            let message = &doc.chat_history.messages[0];
            assert_eq!(message.role, Role::User);
            assert_eq!(message.content, "Hello [[note.md]]");
            assert_eq!(message.references.len(), 1);
            assert_eq!(message.references[0].path, "note.md");
            assert_eq!(doc.workspace.references.len(), 1);
            assert_eq!(doc.workspace.references[0].path, "note.md");
            assert_eq!(doc.workspace.references[0].kind, WorkspaceKind::File);
        }

        #[test]
        fn frontmatter_only_yields_empty_sections() {
            let input = "---\ntitle: Bare\ntype: flow\ntimestamp: 77\ntags: a, b, a\n---\n";
            let doc = parse_document_from_str(None, input);
            assert_eq!(doc.metadata.title, "Bare");
            assert_eq!(doc.metadata.doc_type, DocType::Flow);
            assert_eq!(doc.metadata.timestamp, 77);
            assert_eq!(
                doc.metadata.tags,
                Some(vec![Tag("a".into()), Tag("b".into()), Tag("a".into())])
            );
            assert!(doc.inbox.cards.is_empty());
            assert!(doc.chat_history.messages.is_empty());
            assert!(doc.workspace.references.is_empty());
        }

        #[test]
        fn missing_frontmatter_treats_everything_as_body() {
            let input = "## ChatHistory\n\n### Agent\n\nhi\n";
            let doc = parse_document_from_str(None, input);
            assert_eq!(doc.metadata.title, "New Chat");
            assert_eq!(doc.chat_history.messages.len(), 1);
            assert_eq!(doc.chat_history.messages[0].role, Role::Agent);
            assert_eq!(doc.chat_history.messages[0].content, "hi");
        }

        #[test]
        fn unrecognized_sections_are_dropped() {
            let input = "## Scratchpad\n\njunk\n\n## Inbox\n\n### Card\n\nkeep me\n";
            let doc = parse_document_from_str(None, input);
            assert_eq!(doc.inbox.cards.len(), 1);
            assert_eq!(doc.inbox.cards[0].content, "keep me");
        }

        #[test]
        fn action_token_extracted_and_content_untouched() {
            let input = "## ChatHistory\n\n### Agent\n\n> [search]: [budget report]\nDone.\n";
            let doc = parse_document_from_str(None, input);
            let message = &doc.chat_history.messages[0];
            assert_eq!(message.actions.len(), 1);
            assert_eq!(message.actions[0].kind, ActionKind::Search);
            assert_eq!(
                message.actions[0].params.get("value").map(String::as_str),
                Some("budget report")
            );
            assert!(message.content.contains("> [search]: [budget report]"));
        }

        #[test]
        fn malformed_reference_is_not_extracted() {
            let input = "## ChatHistory\n\nUser: look at [[unterminated\n";
            let doc = parse_document_from_str(None, input);
            let message = &doc.chat_history.messages[0];
            assert!(message.references.is_empty());
            assert_eq!(message.content, "look at [[unterminated");
        }

        #[test]
        fn embedded_ids_are_preserved_verbatim() {
            let input = "## ChatHistory\n\n### User {id: msg-keep} {timestamp: 5}\n\nhello\n";
            let doc = parse_document_from_str(None, input);
            let message = &doc.chat_history.messages[0];
            assert_eq!(message.id, MessageId("msg-keep".into()));
            assert_eq!(message.timestamp, 5);
        }

        #[test]
        fn role_markers_are_case_insensitive() {
            let input = "## ChatHistory\n\n### USER\n\na\n\nagent: b\n";
            let doc = parse_document_from_str(None, input);
            assert_eq!(doc.chat_history.messages.len(), 2);
            assert_eq!(doc.chat_history.messages[0].role, Role::User);
            assert_eq!(doc.chat_history.messages[1].role, Role::Agent);
            assert_eq!(doc.chat_history.messages[1].content, "b");
        }

        #[test]
        fn inbox_cards_parse_headers_and_metadata() {
            let input = "## Inbox\n\n### Card {id: card-a} {timestamp: 3}\n\nhttps://example.com\nsource: clipboard\ntitle: Example\ndescription: A site\n\n### Card\n\nplain note\n";
            let doc = parse_document_from_str(None, input);
            assert_eq!(doc.inbox.cards.len(), 2);

            let first = &doc.inbox.cards[0];
            assert_eq!(first.id, CardId("card-a".into()));
            assert_eq!(first.kind, CardKind::Url);
            assert_eq!(first.content, "https://example.com");
            let meta = first.metadata.as_ref().expect("meta");
            assert_eq!(meta.created, Some(3));
            assert_eq!(meta.source.as_deref(), Some("clipboard"));
            let preview = meta.preview.as_ref().expect("preview");
            assert_eq!(preview.title, "Example");
            assert_eq!(preview.description, "A site");

            let second = &doc.inbox.cards[1];
            assert!(second.id.0.starts_with("card-"));
            assert_eq!(second.kind, CardKind::Text);
            assert!(second.metadata.is_none());
        }

        #[test]
        fn inbox_without_headers_degrades_to_paragraphs() {
            let input = "## Inbox\n\nfirst note\n\nsecond note\nstill second\n";
            let doc = parse_document_from_str(None, input);
            assert_eq!(doc.inbox.cards.len(), 2);
            assert_eq!(doc.inbox.cards[0].content, "first note");
            assert_eq!(doc.inbox.cards[1].content, "second note\nstill second");
        }

        #[test]
        fn workspace_blocks_carry_excerpts_and_kind() {
            let input = "## Workspace\n\nreport.pdf {timestamp: 9}\nfirst excerpt\nsecond excerpt\n\nphoto.PNG\n\nnotes.md\n";
            let doc = parse_document_from_str(None, input);
            let refs = &doc.workspace.references;
            assert_eq!(refs.len(), 3);

            assert_eq!(refs[0].path, "report.pdf");
            assert_eq!(refs[0].kind, WorkspaceKind::Pdf);
            let meta = refs[0].metadata.as_ref().expect("meta");
            assert_eq!(meta.last_accessed, Some(9));
            assert_eq!(meta.excerpts, vec!["first excerpt", "second excerpt"]);

            assert_eq!(refs[1].kind, WorkspaceKind::Image);
            assert!(refs[1].metadata.is_none());
            assert_eq!(refs[2].kind, WorkspaceKind::File);
        }

        #[test]
        fn later_duplicate_section_wins() {
            let input = "## Inbox\n\n### Card\n\nold\n\n## Inbox\n\n### Card\n\nnew\n";
            let doc = parse_document_from_str(None, input);
            assert_eq!(doc.inbox.cards.len(), 1);
            assert_eq!(doc.inbox.cards[0].content, "new");
        }

        #[test]
        fn unclosed_frontmatter_degrades_to_body() {
            let input = "---\ntitle: Oops\n## ChatHistory\n\nUser: hi\n";
            let doc = parse_document_from_str(None, input);
            // delimiter never closes: metadata stays default, body parses
            assert_eq!(doc.metadata.title, "New Chat");
            assert_eq!(doc.chat_history.messages.len(), 1);
        }
    }
}

pub mod format {
    //! The serializer: the exact inverse of `parser`, one writer per
    //! section. Deterministic: the same `Document` value always yields
    //! byte-identical text, and absent timestamps are never invented.
    //! Contract violations (the tolerant policy is parse-side only) fail
    //! loudly with `SerializeError`.

    use super::core::*;
    use std::collections::BTreeSet;

    #[derive(Debug, thiserror::Error)]
    pub enum SerializeError {
        #[error("empty {entity} id")]
        EmptyId { entity: &'static str },
        #[error("duplicate id {0:?} in document")]
        DuplicateId(String),
        #[error("workspace reference with an empty path")]
        EmptyPath,
    }

    pub fn serialize_document(doc: &Document) -> Result<String, SerializeError> {
        check_invariants(doc)?;

        let mut out = String::new();
        write_frontmatter(&mut out, &doc.metadata);
        write_inbox(&mut out, &doc.inbox);
        write_chat_history(&mut out, &doc.chat_history);
        write_workspace(&mut out, &doc.workspace);
        Ok(out)
    }

    /// Ids must be non-empty and unique across the whole document, and
    /// workspace paths non-empty. Anything else is a programming error in
    /// the caller, not an input problem.
    fn check_invariants(doc: &Document) -> Result<(), SerializeError> {
        let mut seen: BTreeSet<&str> = BTreeSet::new();
        for card in &doc.inbox.cards {
            if card.id.0.is_empty() {
                return Err(SerializeError::EmptyId { entity: "card" });
            }
            if !seen.insert(&card.id.0) {
                return Err(SerializeError::DuplicateId(card.id.0.clone()));
            }
        }
        for message in &doc.chat_history.messages {
            if message.id.0.is_empty() {
                return Err(SerializeError::EmptyId { entity: "message" });
            }
            if !seen.insert(&message.id.0) {
                return Err(SerializeError::DuplicateId(message.id.0.clone()));
            }
        }
        for reference in &doc.workspace.references {
            if reference.path.trim().is_empty() {
                return Err(SerializeError::EmptyPath);
            }
        }
        Ok(())
    }

    fn write_frontmatter(out: &mut String, meta: &Metadata) {
        out.push_str("---\n");
        out.push_str(&format!("title: {}\n", meta.title));
        out.push_str(&format!("type: {}\n", meta.doc_type.as_str()));
        out.push_str(&format!("timestamp: {}\n", meta.timestamp));
        if let Some(tags) = &meta.tags {
            let joined = tags
                .iter()
                .map(|t| t.0.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            out.push_str(&format!("tags: {}\n", joined));
        }
        out.push_str("---\n");
    }

    fn write_inbox(out: &mut String, inbox: &InboxSection) {
        out.push_str("\n## Inbox\n");
        for card in &inbox.cards {
            out.push_str("\n### Card {id: ");
            out.push_str(&card.id.0);
            out.push('}');
            if let Some(created) = card.metadata.as_ref().and_then(|m| m.created) {
                out.push_str(&format!(" {{timestamp: {}}}", created));
            }
            out.push_str("\n\n");
            out.push_str(card.content.trim_end());
            out.push('\n');
            if let Some(meta) = &card.metadata {
                if let Some(source) = &meta.source {
                    out.push_str(&format!("source: {}\n", source));
                }
                if let Some(preview) = &meta.preview {
                    out.push_str(&format!("title: {}\n", preview.title));
                    out.push_str(&format!("description: {}\n", preview.description));
                    if let Some(thumbnail) = &preview.thumbnail {
                        out.push_str(&format!("thumbnail: {}\n", thumbnail));
                    }
                }
            }
        }
    }

    fn write_chat_history(out: &mut String, section: &ChatHistorySection) {
        out.push_str("\n## ChatHistory\n");
        for message in &section.messages {
            out.push_str(&format!(
                "\n### {} {{id: {}}} {{timestamp: {}}}\n\n",
                message.role.heading(),
                message.id.0,
                message.timestamp
            ));
            out.push_str(message.content.trim_end());
            out.push('\n');
        }
    }

    fn write_workspace(out: &mut String, section: &WorkspaceSection) {
        out.push_str("\n## Workspace\n");
        for reference in &section.references {
            out.push('\n');
            out.push_str(&reference.path);
            if let Some(last_accessed) = reference.metadata.as_ref().and_then(|m| m.last_accessed)
            {
                out.push_str(&format!(" {{timestamp: {}}}", last_accessed));
            }
            out.push('\n');
            if let Some(meta) = &reference.metadata {
                for excerpt in &meta.excerpts {
                    out.push_str(excerpt);
                    out.push('\n');
                }
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::parser::parse_document_from_str;

        fn assert_same_document(left: &Document, right: &Document) {
            // in-memory identity and origin path are not part of the wire
            // format; everything else must survive
            assert_eq!(left.metadata, right.metadata);
            assert_eq!(left.inbox, right.inbox);
            assert_eq!(left.chat_history, right.chat_history);
            assert_eq!(left.workspace, right.workspace);
        }

        #[test]
        fn round_trips_a_document_built_from_operations() {
            let mut doc = Document::new(None);
            doc.set_title("Budget review");
            doc.metadata.tags = Some(vec![Tag("work".into()), Tag("q3".into())]);
            doc.add_card("https://example.com/report");
            doc.append_message(Role::User, "Please check [[budget.xlsx]]");
            doc.append_message(Role::Agent, "> [search]: [budget report]\nFound it.");
            doc.add_workspace_reference("budget.xlsx");

            let text = serialize_document(&doc).expect("serialize");
            let reparsed = parse_document_from_str(None, &text);
            assert_same_document(&doc, &reparsed);
        }

        #[test]
        fn appended_message_id_survives_the_round_trip() {
            let mut doc = Document::new(None);
            let id = doc.append_message(Role::User, "hello");
            let text = serialize_document(&doc).expect("serialize");
            let reparsed = parse_document_from_str(None, &text);
            assert_eq!(reparsed.chat_history.messages[0].id, id);
        }

        #[test]
        fn reparse_is_idempotent_on_hand_written_text() {
            let input = r#"---
title: Demo
type: chat
timestamp: 1736012345678
---

## Inbox

first thought

## ChatHistory

### User

Hello [[note.md]] and [[note.md]]

Agent: on it {timestamp: 4}

## Workspace

note.md
an excerpt
"#;
            let first = parse_document_from_str(None, input);
            let text = serialize_document(&first).expect("serialize");
            let second = parse_document_from_str(None, &text);
            assert_same_document(&first, &second);

            // the canonical form is a fixed point of serialize-then-parse
            let text_again = serialize_document(&second).expect("serialize");
            assert_eq!(text, text_again);
        }

        #[test]
        fn serialization_is_deterministic() {
            let mut doc = Document::new(None);
            doc.append_message(Role::System, "ready");
            let a = serialize_document(&doc).expect("serialize");
            let b = serialize_document(&doc).expect("serialize");
            assert_eq!(a, b);
        }

        #[test]
        fn reordered_messages_serialize_in_the_new_order() {
            let mut doc = Document::new(None);
            let a = doc.append_message(Role::User, "first");
            let b = doc.append_message(Role::Agent, "second");
            doc.reorder_messages(&[b.clone(), a.clone()]).expect("reorder");

            let text = serialize_document(&doc).expect("serialize");
            let reparsed = parse_document_from_str(None, &text);
            assert_eq!(reparsed.chat_history.messages[0].id, b);
            assert_eq!(reparsed.chat_history.messages[1].id, a);
            assert_eq!(reparsed.chat_history.messages[0].content, "second");
        }

        #[test]
        fn tags_line_is_omitted_when_absent() {
            let doc = Document::new(None);
            let text = serialize_document(&doc).expect("serialize");
            assert!(!text.contains("tags:"));
            let reparsed = parse_document_from_str(None, &text);
            assert_eq!(reparsed.metadata.tags, None);
        }

        #[test]
        fn empty_id_fails_loudly() {
            let mut doc = Document::new(None);
            doc.append_message(Role::User, "x");
            doc.chat_history.messages[0].id = MessageId(String::new());
            assert!(matches!(
                serialize_document(&doc),
                Err(SerializeError::EmptyId { entity: "message" })
            ));
        }

        #[test]
        fn duplicate_ids_fail_loudly() {
            let mut doc = Document::new(None);
            doc.append_message(Role::User, "x");
            doc.append_message(Role::User, "y");
            doc.chat_history.messages[1].id = doc.chat_history.messages[0].id.clone();
            assert!(matches!(
                serialize_document(&doc),
                Err(SerializeError::DuplicateId(_))
            ));
        }

        #[test]
        fn card_metadata_round_trips() {
            let input = "## Inbox\n\n### Card {id: card-a} {timestamp: 3}\n\nhttps://example.com\nsource: clipboard\ntitle: Example\ndescription: A site\nthumbnail: https://example.com/t.png\n";
            let first = parse_document_from_str(None, input);
            let text = serialize_document(&first).expect("serialize");
            let second = parse_document_from_str(None, &text);
            assert_same_document(&first, &second);
        }

        #[test]
        fn empty_document_serializes_all_section_headers() {
            let doc = Document::new(None);
            let text = serialize_document(&doc).expect("serialize");
            assert!(text.contains("## Inbox"));
            assert!(text.contains("## ChatHistory"));
            assert!(text.contains("## Workspace"));
            let reparsed = parse_document_from_str(None, &text);
            assert!(reparsed.inbox.cards.is_empty());
            assert!(reparsed.chat_history.messages.is_empty());
            assert!(reparsed.workspace.references.is_empty());
        }
    }
}

pub mod projectors {
    //! Read models computed from a `Document`. Pure projections; renderers
    //! consume these instead of re-scanning text.

    pub mod reference_index {
        //! Where each path is cited across a document: card bodies, message
        //! references, and workspace entries. Duplicate citations are kept
        //! so views can show citation counts.

        use crate::core::{CardId, Document, MessageId};
        use crate::tokens;
        use serde::{Deserialize, Serialize};
        use std::collections::BTreeMap;

        #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
        pub enum CitationSource {
            Card(CardId),
            Message(MessageId),
            Workspace,
        }

        #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
        pub struct ReferenceIndex {
            pub entries: BTreeMap<String, Vec<CitationSource>>,
        }

        impl ReferenceIndex {
            pub fn citation_count(&self, path: &str) -> usize {
                self.entries.get(path).map(Vec::len).unwrap_or(0)
            }
        }

        pub fn project(doc: &Document) -> ReferenceIndex {
            let mut index = ReferenceIndex::default();
            for card in &doc.inbox.cards {
                for path in tokens::extract(&card.content).references {
                    index
                        .entries
                        .entry(path)
                        .or_default()
                        .push(CitationSource::Card(card.id.clone()));
                }
            }
            for message in &doc.chat_history.messages {
                for reference in &message.references {
                    index
                        .entries
                        .entry(reference.path.clone())
                        .or_default()
                        .push(CitationSource::Message(message.id.clone()));
                }
            }
            for reference in &doc.workspace.references {
                index
                    .entries
                    .entry(reference.path.clone())
                    .or_default()
                    .push(CitationSource::Workspace);
            }
            index
        }

        #[cfg(test)]
        mod tests {
            use super::*;
            use crate::core::{Document, Role};

            #[test]
            fn counts_citations_across_sections() {
                let mut doc = Document::new(None);
                doc.add_card("see [[plan.md]]");
                doc.append_message(Role::User, "also [[plan.md]] and [[plan.md]]");
                doc.add_workspace_reference("plan.md");
                doc.add_workspace_reference("other.pdf");

                let index = project(&doc);
                assert_eq!(index.citation_count("plan.md"), 4);
                assert_eq!(index.citation_count("other.pdf"), 1);
                assert_eq!(index.citation_count("missing.md"), 0);
            }
        }
    }
}

pub use format::serialize_document;
pub use parser::{MarkdownDocumentParser, parse_document_from_str};
