//! Forward-tokenized multi-field inverted index over `{title, content, tags,
//! aliases}`, with per-field prefix matching and `#tag`-filter semantics.

use std::collections::{BTreeMap, HashMap, HashSet};

use unicode_normalization::UnicodeNormalization;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Title,
    Content,
    Tags,
    Aliases,
}

impl Field {
    pub const ALL: [Field; 4] = [Field::Title, Field::Content, Field::Tags, Field::Aliases];
}

/// Lowercase, strip combining diacritical marks, split on non-alphanumeric,
/// and drop empty tokens.
pub fn tokenize(text: &str) -> Vec<String> {
    text.nfd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>()
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn is_combining_mark(c: char) -> bool {
    matches!(c as u32, 0x0300..=0x036F)
}

/// A single field's token -> row-id postings, ordered for prefix range scans.
#[derive(Default)]
struct FieldIndex {
    postings: BTreeMap<String, Vec<u32>>,
}

impl FieldIndex {
    fn insert(&mut self, token: &str, row: u32) {
        let rows = self.postings.entry(token.to_string()).or_default();
        if rows.last() != Some(&row) {
            rows.push(row);
        }
    }

    /// Rows whose token begins with `prefix`, in ascending token order, each
    /// row id appearing once, capped at `limit`.
    fn prefix_matches(&self, prefix: &str, limit: usize) -> Vec<u32> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        for (token, rows) in self.postings.range(prefix.to_string()..) {
            if !token.starts_with(prefix) {
                break;
            }
            for &row in rows {
                if seen.insert(row) {
                    out.push(row);
                    if out.len() >= limit {
                        return out;
                    }
                }
            }
        }
        out
    }
}

/// Per-field candidate rows for one query, in per-field match order.
#[derive(Debug, Clone)]
pub struct FieldHits {
    pub field: Field,
    pub rows: Vec<u32>,
}

/// A document's field text, as handed to `LexicalIndex::build`.
pub struct DocumentFields<'a> {
    pub title: &'a str,
    pub content: &'a str,
    pub tags: &'a [String],
    pub aliases: &'a [String],
}

pub struct LexicalIndex {
    ids: Vec<String>,
    title_tokens: Vec<Vec<String>>,
    fields: HashMap<Field, FieldIndex>,
    /// Atomic (unsplit), lowercased tags, for `#tag` prefix/filter semantics.
    raw_tags: FieldIndex,
}

/// A leading-`#` query, switching to tag-filter semantics.
struct TagQuery {
    tag: String,
    term: Option<String>,
}

impl TagQuery {
    fn parse(query: &str) -> Option<Self> {
        let trimmed = query.trim();
        let rest = trimmed.strip_prefix('#')?;
        let mut parts = rest.splitn(2, char::is_whitespace);
        let tag = parts.next().unwrap_or("").to_lowercase();
        if tag.is_empty() {
            return None;
        }
        let term = parts
            .next()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        Some(Self { tag, term })
    }
}

impl LexicalIndex {
    pub fn build(ids: Vec<String>, docs: &[DocumentFields]) -> Self {
        debug_assert_eq!(ids.len(), docs.len());

        let mut fields: HashMap<Field, FieldIndex> =
            Field::ALL.into_iter().map(|f| (f, FieldIndex::default())).collect();
        let mut raw_tags = FieldIndex::default();
        let mut title_tokens = Vec::with_capacity(docs.len());

        for (i, doc) in docs.iter().enumerate() {
            let row = i as u32;

            let t_tokens = tokenize(doc.title);
            for tok in &t_tokens {
                fields.get_mut(&Field::Title).unwrap().insert(tok, row);
            }
            title_tokens.push(t_tokens);

            for tok in tokenize(doc.content) {
                fields.get_mut(&Field::Content).unwrap().insert(&tok, row);
            }
            for tag in doc.tags {
                for tok in tokenize(tag) {
                    fields.get_mut(&Field::Tags).unwrap().insert(&tok, row);
                }
                raw_tags.insert(&tag.to_lowercase(), row);
            }
            for alias in doc.aliases {
                for tok in tokenize(alias) {
                    fields.get_mut(&Field::Aliases).unwrap().insert(&tok, row);
                }
            }
        }

        Self { ids, title_tokens, fields, raw_tags }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn row_id(&self, row: u32) -> &str {
        &self.ids[row as usize]
    }

    pub fn title_tokens(&self, row: u32) -> &[String] {
        &self.title_tokens[row as usize]
    }

    /// Evaluate a query against every field, up to `per_field_limit` rows
    /// each. A leading `#` switches to tag-filter semantics instead.
    pub fn search(&self, query: &str, per_field_limit: usize) -> Vec<FieldHits> {
        if let Some(tq) = TagQuery::parse(query) {
            return self.search_tag(&tq, per_field_limit);
        }

        let tokens = tokenize(query);
        if tokens.is_empty() {
            return Vec::new();
        }
        Field::ALL
            .into_iter()
            .map(|field| FieldHits { field, rows: self.field_query(field, &tokens, per_field_limit) })
            .collect()
    }

    fn field_query(&self, field: Field, tokens: &[String], limit: usize) -> Vec<u32> {
        let index = &self.fields[&field];
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        for tok in tokens {
            for row in index.prefix_matches(tok, limit) {
                if seen.insert(row) {
                    out.push(row);
                    if out.len() >= limit {
                        return out;
                    }
                }
            }
        }
        out
    }

    fn search_tag(&self, tq: &TagQuery, limit: usize) -> Vec<FieldHits> {
        let tagged_rows = self.raw_tags.prefix_matches(&tq.tag, usize::MAX);

        match &tq.term {
            None => {
                let mut rows = tagged_rows;
                rows.truncate(limit);
                vec![FieldHits { field: Field::Tags, rows }]
            }
            Some(term) => {
                let tag_set: HashSet<u32> = tagged_rows.into_iter().collect();
                let tokens = tokenize(term);
                Field::ALL
                    .into_iter()
                    .map(|field| {
                        let rows = self
                            .field_query(field, &tokens, usize::MAX)
                            .into_iter()
                            .filter(|r| tag_set.contains(r))
                            .take(limit)
                            .collect();
                        FieldHits { field, rows }
                    })
                    .collect()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_index() -> LexicalIndex {
        let ids = vec!["intro".to_string(), "guide".to_string(), "faq".to_string()];
        let tags0 = vec!["rust".to_string(), "beginner".to_string()];
        let tags1 = vec!["rust".to_string(), "advanced".to_string()];
        let tags2 = vec!["help".to_string()];
        let aliases1 = vec!["handbook".to_string()];
        let docs = vec![
            DocumentFields {
                title: "Getting Started",
                content: "An introduction to the café workflow.",
                tags: &tags0,
                aliases: &[],
            },
            DocumentFields {
                title: "Advanced Guide",
                content: "Deep dive into rust internals and parsers.",
                tags: &tags1,
                aliases: &aliases1,
            },
            DocumentFields {
                title: "FAQ",
                content: "Frequently asked questions about setup.",
                tags: &tags2,
                aliases: &[],
            },
        ];
        LexicalIndex::build(ids, &docs)
    }

    #[test]
    fn tokenize_lowercases_strips_diacritics_and_splits() {
        assert_eq!(tokenize("Café-Society!"), vec!["cafe", "society"]);
        assert_eq!(tokenize(""), Vec::<String>::new());
    }

    #[test]
    fn prefix_match_finds_partial_query_token() {
        let idx = sample_index();
        let hits = idx.search("pars", 10);
        let content = hits.iter().find(|h| h.field == Field::Content).unwrap();
        assert!(content.rows.contains(&1));
    }

    #[test]
    fn bare_tag_query_returns_docs_by_tag_prefix() {
        let idx = sample_index();
        let hits = idx.search("#rust", 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].field, Field::Tags);
        let mut rows = hits[0].rows.clone();
        rows.sort();
        assert_eq!(rows, vec![0, 1]);
    }

    #[test]
    fn tagged_term_query_restricts_to_tag_and_searches_term() {
        let idx = sample_index();
        let hits = idx.search("#rust parsers", 10);
        let content = hits.iter().find(|h| h.field == Field::Content).unwrap();
        assert_eq!(content.rows, vec![1]);
    }

    #[test]
    fn title_tokens_are_available_for_boost_calculation() {
        let idx = sample_index();
        assert_eq!(idx.title_tokens(0), &["getting".to_string(), "started".to_string()]);
    }

    #[test]
    fn empty_query_yields_no_hits() {
        let idx = sample_index();
        assert!(idx.search("   ", 10).is_empty());
    }
}
