//! Eagerly materialized cursor over result rows.

/// Cursor over rows that are already held in memory.
///
/// Starts positioned before the first row; [`next()`](HeapCursor::next)
/// advances and reports whether a row is available.
#[derive(Debug, Clone)]
pub struct HeapCursor<C> {
    rows: Vec<C>,
    /// Index of the current row plus one; 0 = before first.
    position: usize,
}

impl<C> HeapCursor<C> {
    #[must_use]
    pub fn new(rows: Vec<C>) -> Self {
        Self { rows, position: 0 }
    }

    /// Advances to the next row. Returns `false` once the rows are exhausted.
    pub fn next(&mut self) -> bool {
        if self.position < self.rows.len() {
            self.position += 1;
            true
        } else {
            false
        }
    }

    /// The row the cursor is positioned on, if any.
    #[must_use]
    pub fn current(&self) -> Option<&C> {
        self.position.checked_sub(1).and_then(|i| self.rows.get(i))
    }

    /// Whether another call to `next()` would succeed.
    #[must_use]
    pub fn has_next(&self) -> bool {
        self.position < self.rows.len()
    }

    /// Moves back before the first row.
    pub fn reset(&mut self) {
        self.position = 0;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[C] {
        &self.rows
    }

    pub fn iter(&self) -> std::slice::Iter<'_, C> {
        self.rows.iter()
    }

    #[must_use]
    pub fn into_rows(self) -> Vec<C> {
        self.rows
    }
}

impl<C> Default for HeapCursor<C> {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl<C> IntoIterator for HeapCursor<C> {
    type Item = C;
    type IntoIter = std::vec::IntoIter<C>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walks_rows_in_order() {
        let mut cursor = HeapCursor::new(vec!["a", "b"]);
        assert!(cursor.current().is_none());
        assert!(cursor.has_next());
        assert!(cursor.next());
        assert_eq!(cursor.current(), Some(&"a"));
        assert!(cursor.next());
        assert_eq!(cursor.current(), Some(&"b"));
        assert!(!cursor.next());
        assert_eq!(cursor.current(), Some(&"b"));

        cursor.reset();
        assert!(cursor.next());
        assert_eq!(cursor.current(), Some(&"a"));
    }

    #[test]
    fn empty_cursor_has_no_rows() {
        let mut cursor: HeapCursor<u8> = HeapCursor::default();
        assert!(cursor.is_empty());
        assert!(!cursor.next());
        assert!(cursor.current().is_none());
    }
}
