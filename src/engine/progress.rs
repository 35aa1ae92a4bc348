use crate::model::{AggregateProgress, QueueItem, QueueItemStatus};

/// Percentage over the items taking part in the current operation.
///
/// Settled items (completed or failed) count as 100, in-flight items contribute their own
/// progress, pending ones nothing. With a single item in flight this is
/// `(settled * 100 + current) / total`. The "current" item is the first one downloading.
pub fn aggregate<'a, I>(items: I) -> Option<AggregateProgress>
where
  I: IntoIterator<Item = &'a QueueItem>,
{
  let mut total = 0usize;
  let mut settled = 0usize;
  let mut in_flight = 0.0f64;
  let mut current: Option<&QueueItem> = None;

  for item in items {
    total += 1;
    match item.status {
      QueueItemStatus::Completed | QueueItemStatus::Error => settled += 1,
      QueueItemStatus::Downloading => {
        in_flight += item.progress.clamp(0.0, 100.0);
        if current.is_none() {
          current = Some(item);
        }
      }
      QueueItemStatus::Pending => {}
    }
  }

  if total == 0 {
    return None;
  }

  let percent = ((settled as f64 * 100.0 + in_flight) / total as f64).clamp(0.0, 100.0);
  Some(AggregateProgress {
    percent,
    settled,
    total,
    current_item_id: current.map(|i| i.id.clone()),
    current_title: current.and_then(|i| i.title.clone()),
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::engine::queue::{apply_event, items_from_info, ItemEvent};
  use crate::model::{DownloadOptions, VideoInfo};

  fn item_at(status: QueueItemStatus, progress: f64) -> QueueItem {
    let mut item = items_from_info(
      "https://youtu.be/x",
      &DownloadOptions::default(),
      &VideoInfo::default(),
      None,
    )
    .remove(0);
    if status != QueueItemStatus::Pending {
      item = apply_event(&item, &ItemEvent::Start).unwrap();
      item = apply_event(&item, &ItemEvent::Progress { progress, title: None }).unwrap();
    }
    match status {
      QueueItemStatus::Completed => apply_event(&item, &ItemEvent::Complete { filename: None }).unwrap(),
      QueueItemStatus::Error => apply_event(&item, &ItemEvent::Fail { message: "x".into() }).unwrap(),
      _ => item,
    }
  }

  #[test]
  fn two_done_one_at_forty_is_eighty_percent() {
    let items = vec![
      item_at(QueueItemStatus::Completed, 100.0),
      item_at(QueueItemStatus::Completed, 100.0),
      item_at(QueueItemStatus::Downloading, 40.0),
    ];
    let agg = aggregate(&items).unwrap();
    assert!((agg.percent - 80.0).abs() < 1e-9);
    assert_eq!(agg.settled, 2);
    assert_eq!(agg.total, 3);
    assert_eq!(agg.current_item_id.as_deref(), Some(items[2].id.as_str()));
  }

  #[test]
  fn interleaving_order_does_not_matter() {
    let mut items = vec![
      item_at(QueueItemStatus::Downloading, 25.0),
      item_at(QueueItemStatus::Error, 10.0),
      item_at(QueueItemStatus::Pending, 0.0),
      item_at(QueueItemStatus::Downloading, 75.0),
    ];
    let forward = aggregate(&items).unwrap().percent;
    items.reverse();
    let backward = aggregate(&items).unwrap().percent;
    assert!((forward - backward).abs() < 1e-9);
    assert!((forward - 50.0).abs() < 1e-9);
  }

  #[test]
  fn empty_set_has_no_progress() {
    assert!(aggregate(&Vec::<QueueItem>::new()).is_none());
  }
}
