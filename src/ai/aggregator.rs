/// Running text of the assistant reply for one stream.
#[derive(Debug, Default, Clone)]
pub struct DeltaAggregator {
    content: String,
}

impl DeltaAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment and return everything received so far.
    pub fn append(&mut self, fragment: &str) -> &str {
        self.content.push_str(fragment);
        &self.content
    }

    pub fn snapshot(&self) -> &str {
        &self.content
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    pub fn reset(&mut self) {
        self.content.clear();
    }
}
