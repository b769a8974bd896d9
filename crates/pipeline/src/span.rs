//! Key ranges pulled from the upstream store.

use bytes::{BufMut, Bytes, BytesMut};

use drift_model::{TableId, DDL_KEY_PREFIX, ROW_KEY_PREFIX};

/// A half-open key range `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Span {
    pub start: Bytes,
    pub end: Bytes,
}

impl Span {
    pub fn contains(&self, key: &[u8]) -> bool {
        key >= self.start.as_ref() && key < self.end.as_ref()
    }

    /// Table id encoded in this span's start key, if it is a table span.
    pub fn table_id(&self) -> Option<TableId> {
        drift_model::table_id_from_key(&self.start)
    }
}

fn table_prefix(table_id: TableId) -> BytesMut {
    let mut buf = BytesMut::with_capacity(9);
    buf.put_u8(ROW_KEY_PREFIX);
    buf.put_i64(table_id);
    buf
}

/// Key range of one table.
///
/// With old-value capture the whole table range is pulled (the upstream
/// source attaches previous values to every entry in it); without it only
/// the record sub-range `t{id}_r..t{id}_s` is needed.
pub fn table_span(table_id: TableId, enable_old_value: bool) -> Span {
    if enable_old_value {
        let start = table_prefix(table_id).freeze();
        let end = table_prefix(table_id + 1).freeze();
        Span { start, end }
    } else {
        let mut start = table_prefix(table_id);
        start.put_slice(b"_r");
        let mut end = table_prefix(table_id);
        end.put_slice(b"_s");
        Span {
            start: start.freeze(),
            end: end.freeze(),
        }
    }
}

/// Key range carrying DDL jobs (the meta prefix).
pub fn ddl_span() -> Span {
    Span {
        start: Bytes::from_static(&[DDL_KEY_PREFIX]),
        end: Bytes::from_static(&[DDL_KEY_PREFIX + 1]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drift_model::encode_row_key;

    #[test]
    fn test_row_span_contains_own_rows_only() {
        let span = table_span(7, false);
        assert!(span.contains(&encode_row_key(7, 0)));
        assert!(span.contains(&encode_row_key(7, i64::MAX)));
        assert!(!span.contains(&encode_row_key(8, 0)));
        assert_eq!(span.table_id(), Some(7));
    }

    #[test]
    fn test_old_value_span_covers_whole_table() {
        let narrow = table_span(7, false);
        let wide = table_span(7, true);
        assert!(wide.start < narrow.start);
        assert!(wide.end >= narrow.end);
        assert!(wide.contains(&encode_row_key(7, 42)));
    }

    #[test]
    fn test_ddl_span_excludes_rows() {
        let span = ddl_span();
        assert!(span.contains(b"m_jobs"));
        assert!(!span.contains(&encode_row_key(1, 1)));
    }
}
