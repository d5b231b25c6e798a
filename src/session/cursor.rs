//! Client-side cursor over the server-held suffix-array range of a query.
//!
//! The server answers a query with `[start, end)` and then streams the
//! suffix array one fixed-size page at a time. The cursor decides which
//! entries of each page fall inside the match window and advances itself.

use std::fmt;

use crate::error::ProtocolError;

/// Upper bound of the match window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpperBound {
    Bounded(i64),
    /// The bound already fell inside a fetched page; every later entry is
    /// past the window. The server reports this state as `-1`.
    Consumed,
}

impl UpperBound {
    /// Wire/CSV form: the bound, or `-1` once consumed.
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Bounded(end) => end,
            Self::Consumed => -1,
        }
    }
}

/// Where a suffix-array entry sits relative to the match window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Precedes the window (`>`).
    Before,
    Within,
    /// Follows the window (`<`).
    After,
}

impl Placement {
    pub fn marker(self) -> Option<char> {
        match self {
            Self::Before => Some('>'),
            Self::Within => None,
            Self::After => Some('<'),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuffixEntry {
    pub position: i32,
    pub placement: Placement,
}

impl fmt::Display for SuffixEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.placement.marker() {
            Some(marker) => write!(f, "{marker} {}", self.position),
            None => write!(f, "{}", self.position),
        }
    }
}

/// One decrypted, classified page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuffixPage {
    pub entries: Vec<SuffixEntry>,
    /// Server-side time spent producing the page.
    pub server_time: i64,
}

impl SuffixPage {
    pub fn occurrences(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.placement == Placement::Within)
            .count()
    }

    pub fn within(&self) -> impl Iterator<Item = i32> + '_ {
        self.entries
            .iter()
            .filter(|e| e.placement == Placement::Within)
            .map(|e| e.position)
    }
}

/// Pagination state for one query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryCursor {
    start: i64,
    end: UpperBound,
    max_occurrences: Option<u64>,
    pages: u64,
    occurrences: u64,
    query_time: i64,
    fetch_time: i64,
}

impl QueryCursor {
    /// Cursor for a server-reported range. An `end` of `-1` means the bound
    /// is already consumed.
    pub fn new(start: i32, end: i32, query_time: i64) -> Self {
        let end = if end == -1 {
            UpperBound::Consumed
        } else {
            UpperBound::Bounded(i64::from(end))
        };
        Self {
            start: i64::from(start),
            end,
            max_occurrences: None,
            pages: 0,
            occurrences: 0,
            query_time,
            fetch_time: 0,
        }
    }

    /// Stop [`QueryCursor::wants_more`] once this many pages were fetched.
    /// Each fetched page counts as one occurrence; `None` is unbounded.
    pub fn with_max_occurrences(mut self, max: Option<u64>) -> Self {
        self.max_occurrences = max;
        self
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    pub fn end(&self) -> UpperBound {
        self.end
    }

    /// Pages applied since the query.
    pub fn pages(&self) -> u64 {
        self.pages
    }

    /// In-window entries seen so far.
    pub fn occurrences(&self) -> u64 {
        self.occurrences
    }

    pub fn query_time(&self) -> i64 {
        self.query_time
    }

    /// Sum of the server time of every page applied so far.
    pub fn fetch_time(&self) -> i64 {
        self.fetch_time
    }

    /// `start >= end`, or the bound is consumed.
    pub fn is_exhausted(&self) -> bool {
        match self.end {
            UpperBound::Bounded(end) => self.start >= end,
            UpperBound::Consumed => true,
        }
    }

    /// Whether a bounded fetch loop should request another page.
    pub fn wants_more(&self) -> bool {
        let below_max = self.max_occurrences.map_or(true, |max| self.pages < max);
        below_max && !self.is_exhausted()
    }

    /// Classify one page of suffix positions and advance the cursor.
    ///
    /// With page length `P`, `start` is first aligned down to a page boundary
    /// (`idx1 = start mod P`). If `end - start >= P` the whole tail of the
    /// page is in range (`idx2 = P`); otherwise the bound falls in this page
    /// (`idx2 = end mod P`) and is consumed. Once consumed, `idx2 = -1`.
    /// Entries below `idx1` precede the window, entries above `idx2` follow
    /// it, the rest (inclusive) are in it. `start` then advances by `P`.
    pub fn apply_page(
        &mut self,
        positions: Vec<i32>,
        server_time: i64,
    ) -> Result<SuffixPage, ProtocolError> {
        let page_len = i64::try_from(positions.len()).map_err(|_| ProtocolError::EmptyPage)?;
        if page_len == 0 {
            return Err(ProtocolError::EmptyPage);
        }

        let idx1 = self.start.rem_euclid(page_len);
        self.start -= idx1;

        let idx2 = match self.end {
            UpperBound::Bounded(end) if end - self.start >= page_len => page_len,
            UpperBound::Bounded(end) => {
                self.end = UpperBound::Consumed;
                end.rem_euclid(page_len)
            }
            UpperBound::Consumed => -1,
        };

        self.start += page_len;

        let entries: Vec<SuffixEntry> = positions
            .into_iter()
            .enumerate()
            .map(|(i, position)| {
                let i = i as i64;
                let placement = if i > idx2 {
                    Placement::After
                } else if i < idx1 {
                    Placement::Before
                } else {
                    Placement::Within
                };
                SuffixEntry {
                    position,
                    placement,
                }
            })
            .collect();

        let page = SuffixPage {
            entries,
            server_time,
        };
        self.pages += 1;
        self.occurrences += page.occurrences() as u64;
        self.fetch_time += server_time;

        tracing::debug!(
            page_len,
            idx1,
            idx2,
            next_start = self.start,
            end = self.end.as_i64(),
            "suffix page classified"
        );

        Ok(page)
    }
}
