/// Per-session context carrying the calling application, author and a
/// stream identifier for log correlation.
/// Threaded through every storage session a view opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    /// Identifier of the application issuing requests.
    pub app_id: String,
    /// Author recorded on writes. `None` for anonymous sessions.
    pub author: Option<String>,
    /// Identifier correlating all log lines of one logical request stream.
    pub stream_id: String,
}

impl RequestContext {
    pub fn new(app_id: impl Into<String>, stream_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            author: None,
            stream_id: stream_id.into(),
        }
    }

    #[must_use]
    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }
}
