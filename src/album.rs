use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::platform::SourcePost;

/// Items collected for one group id while its flush timer runs.
#[derive(Debug)]
struct AlbumGroup {
    items: Vec<SourcePost>,
}

/// Buffers multi-item posts by group id and hands each group over as one
/// unit once the buffering delay has passed.
///
/// A group id with an entry in `groups` is buffering. The flush task removes
/// the entry under the same lock appends take, so an item arriving at flush
/// time either lands in the flushed group or opens a fresh one.
#[derive(Clone)]
pub struct AlbumAggregator {
    delay: Duration,
    groups: Arc<Mutex<HashMap<String, AlbumGroup>>>,
    flushed: mpsc::UnboundedSender<Vec<SourcePost>>,
}

impl AlbumAggregator {
    /// Returns the aggregator and the receiving end flushed groups arrive on.
    pub fn new(delay: Duration) -> (Self, mpsc::UnboundedReceiver<Vec<SourcePost>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let aggregator = Self {
            delay,
            groups: Arc::new(Mutex::new(HashMap::new())),
            flushed: tx,
        };
        (aggregator, rx)
    }

    /// Buffer an item. Items without a group id are rejected and returned.
    pub async fn push(&self, post: SourcePost) -> Result<(), SourcePost> {
        let group_id = match post.group_id.clone() {
            Some(id) => id,
            None => return Err(post),
        };

        let mut groups = self.groups.lock().await;
        match groups.get_mut(&group_id) {
            Some(group) => {
                group.items.push(post);
                debug!("Album {}: {} item(s) buffered", group_id, group.items.len());
            }
            None => {
                groups.insert(group_id.clone(), AlbumGroup { items: vec![post] });
                debug!("Album {}: buffering for {:?}", group_id, self.delay);
                self.schedule_flush(group_id);
            }
        }
        Ok(())
    }

    /// Fold an edit into a group that has not been flushed yet, replacing
    /// the buffered item with the same identity. The edited content then goes
    /// out with the first delivery. Returns the post when there is nothing
    /// buffered to replace.
    pub async fn apply_edit(&self, mut post: SourcePost) -> Result<(), SourcePost> {
        let group_id = match post.group_id.as_deref() {
            Some(id) => id,
            None => return Err(post),
        };

        let mut groups = self.groups.lock().await;
        let slot = groups.get_mut(group_id).and_then(|group| {
            group
                .items
                .iter_mut()
                .find(|item| item.channel == post.channel && item.message == post.message)
        });
        match slot {
            Some(slot) => {
                debug!("Album {}: edit of {} applied before flush", group_id, post.key());
                post.is_edit = false;
                *slot = post;
                Ok(())
            }
            None => Err(post),
        }
    }

    fn schedule_flush(&self, group_id: String) {
        let groups = Arc::clone(&self.groups);
        let tx = self.flushed.clone();
        let delay = self.delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let taken = groups.lock().await.remove(&group_id);
            if let Some(group) = taken {
                info!("Album {}: flushing {} item(s)", group_id, group.items.len());
                if tx.send(group.items).is_err() {
                    warn!("Album {}: consumer gone, group dropped", group_id);
                }
            }
        });
    }

    #[cfg(test)]
    pub async fn is_buffering(&self, group_id: &str) -> bool {
        self.groups.lock().await.contains_key(group_id)
    }

    pub async fn buffered_groups(&self) -> usize {
        self.groups.lock().await.len()
    }
}
