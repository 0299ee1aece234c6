// Derives the "synced" flag from downloader activity and connection
// presence, reporting only edges.
#[derive(Debug, Default)]
pub struct SyncState {
    has_connections: bool,
    header_download: bool,
    block_download: bool,
    published: Option<bool>,
}

impl SyncState {
    pub fn set_has_connections(&mut self, value: bool) {
        self.has_connections = value;
    }

    pub fn set_header_download(&mut self, value: bool) {
        self.header_download = value;
    }

    pub fn set_block_download(&mut self, value: bool) {
        self.block_download = value;
    }

    pub fn synced(&self) -> bool {
        self.has_connections && !self.header_download && !self.block_download
    }

    pub fn detect_change(&mut self) -> Option<bool> {
        let synced = self.synced();
        if self.published == Some(synced) {
            return None;
        }
        self.published = Some(synced);
        Some(synced)
    }
}
