use serde::{Deserialize, Serialize};

use super::r#trait::{EventStoreError, StoredEvent};

/// How many events one page may hold.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageLimit {
    /// At most `n` events; `n` must be positive.
    Bounded(u32),
    /// Everything from the offset to the end of the stream, in one fetch.
    Unbounded,
}

impl Default for PageLimit {
    fn default() -> Self {
        PageLimit::Bounded(100)
    }
}

impl PageLimit {
    pub fn validate(self) -> Result<Self, EventStoreError> {
        match self {
            PageLimit::Bounded(0) => Err(EventStoreError::InvalidRead(
                "page limit must be positive".to_string(),
            )),
            other => Ok(other),
        }
    }
}

impl TryFrom<i64> for PageLimit {
    type Error = EventStoreError;

    /// Negative values mean "read to the end"; zero is rejected.
    fn try_from(raw: i64) -> Result<Self, Self::Error> {
        if raw < 0 {
            return Ok(PageLimit::Unbounded);
        }
        let n = u32::try_from(raw)
            .map_err(|_| EventStoreError::InvalidRead(format!("page limit {raw} is too large")))?;
        PageLimit::Bounded(n).validate()
    }
}

/// One page of a stream read.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamPage {
    pub events: Vec<StoredEvent>,
    /// Offset this page was read from.
    pub skip: u64,
    pub limit: PageLimit,
    /// Set by the provider when no events exist past this page.
    pub exhausted: bool,
}

impl StreamPage {
    /// Offset of the next page, if one may exist.
    ///
    /// A page continues only when it is full and the provider did not report
    /// the end of the stream.
    pub fn next_skip(&self) -> Option<u64> {
        if self.exhausted {
            return None;
        }
        match self.limit {
            PageLimit::Bounded(n) if self.events.len() == n as usize => {
                Some(self.skip + self.events.len() as u64)
            }
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(len: usize, limit: PageLimit, exhausted: bool) -> StreamPage {
        use relay_core::AggregateId;
        use relay_events::DomainEvent;

        let events = (0..len)
            .map(|i| StoredEvent {
                position: i as u64 + 1,
                recorded_at: chrono::Utc::now(),
                event: DomainEvent::new(
                    "accountOpened",
                    AggregateId::new(format!("acc-{i}")).unwrap(),
                    0,
                    serde_json::Value::Null,
                )
                .unwrap(),
            })
            .collect();
        StreamPage {
            events,
            skip: 10,
            limit,
            exhausted,
        }
    }

    #[test]
    fn raw_limits() {
        assert_eq!(PageLimit::try_from(-1).unwrap(), PageLimit::Unbounded);
        assert_eq!(PageLimit::try_from(25).unwrap(), PageLimit::Bounded(25));
        assert!(PageLimit::try_from(0).is_err());
    }

    #[test]
    fn only_full_open_pages_continue() {
        assert_eq!(page(3, PageLimit::Bounded(3), false).next_skip(), Some(13));
        assert_eq!(page(3, PageLimit::Bounded(3), true).next_skip(), None);
        assert_eq!(page(2, PageLimit::Bounded(3), false).next_skip(), None);
        assert_eq!(page(5, PageLimit::Unbounded, false).next_skip(), None);
    }
}
