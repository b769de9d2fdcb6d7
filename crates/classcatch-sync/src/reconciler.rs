use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use classcatch_core::{CourseBatch, CourseKey, CourseRecord, EnrollmentChange, ScrapedRow};
use classcatch_storage::{CourseStore, StoreError};
use tracing::{debug, info};

/// Diffs one scraped page against the stored sections of `term`.
///
/// Rows stamped with another term are skipped. When a key appears more than
/// once the last row wins. Creates and updates come out in natural course order.
pub fn plan_batch(rows: Vec<ScrapedRow>, term: &str, existing: &[CourseRecord]) -> CourseBatch {
    let stored: HashMap<CourseKey, &CourseRecord> = existing.iter().map(|r| (r.key(), r)).collect();

    let mut skipped = 0usize;
    let mut latest: HashMap<CourseKey, ScrapedRow> = HashMap::new();
    for mut row in rows {
        if !row.term.is_empty() && row.term != term {
            debug!(row_term = %row.term, key = %row.key(), "row belongs to another term");
            skipped += 1;
            continue;
        }
        row.term = term.to_string();
        latest.insert(row.key(), row);
    }

    let mut ordered: Vec<(CourseKey, ScrapedRow)> = latest.into_iter().collect();
    ordered.sort_by(|(a, _), (b, _)| a.natural_cmp(b));

    let mut batch = CourseBatch {
        term: term.to_string(),
        skipped,
        ..Default::default()
    };
    for (key, row) in ordered {
        match stored.get(&key) {
            Some(record) => {
                if record.row.enrollment != row.enrollment {
                    batch.changes.push(EnrollmentChange {
                        key,
                        term: term.to_string(),
                        previous_enrollment: record.row.enrollment,
                        new_enrollment: row.enrollment,
                        limit: row.limit,
                    });
                }
                batch.updates.push(row);
            }
            None => batch.creates.push(row),
        }
    }
    batch
}

#[derive(Clone)]
pub struct DataReconciler {
    store: Arc<dyn CourseStore>,
}

impl DataReconciler {
    pub fn new(store: Arc<dyn CourseStore>) -> Self {
        Self { store }
    }

    /// Plans against the current store contents and commits the batch as one unit.
    pub async fn reconcile(
        &self,
        rows: Vec<ScrapedRow>,
        term: &str,
        at: DateTime<Utc>,
    ) -> Result<CourseBatch, StoreError> {
        let existing = self.store.courses_for_term(term).await?;
        let batch = plan_batch(rows, term, &existing);
        if !batch.is_empty() {
            self.store.apply_batch(&batch, at).await?;
        }
        info!(
            term,
            creates = batch.creates.len(),
            updates = batch.updates.len(),
            changes = batch.changes.len(),
            skipped = batch.skipped,
            "course batch committed"
        );
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use classcatch_storage::MemoryStore;

    fn row(subject: &str, number: &str, section: &str, limit: i32, enrollment: i32) -> ScrapedRow {
        ScrapedRow {
            subject_code: subject.to_string(),
            course_number: number.to_string(),
            section: section.to_string(),
            term: "202501".to_string(),
            limit,
            enrollment,
            ..Default::default()
        }
    }

    fn stored(row: ScrapedRow) -> CourseRecord {
        CourseRecord {
            row,
            last_updated: Utc::now(),
        }
    }

    #[test]
    fn new_section_is_a_create_without_change() {
        let batch = plan_batch(vec![row("COSC", "1", "1", 30, 30)], "202501", &[]);
        assert_eq!(batch.creates.len(), 1);
        assert!(batch.updates.is_empty());
        assert!(batch.changes.is_empty());
    }

    #[test]
    fn enrollment_drop_is_an_update_with_change() {
        let existing = [stored(row("COSC", "1", "1", 30, 30))];
        let batch = plan_batch(vec![row("COSC", "1", "1", 30, 25)], "202501", &existing);
        assert!(batch.creates.is_empty());
        assert_eq!(batch.updates.len(), 1);
        assert_eq!(batch.changes.len(), 1);
        let change = &batch.changes[0];
        assert_eq!(change.previous_enrollment, 30);
        assert_eq!(change.new_enrollment, 25);
        assert!(change.opened_up());
    }

    #[test]
    fn unchanged_enrollment_still_updates_other_fields() {
        let existing = [stored(row("COSC", "1", "1", 30, 30))];
        let mut scraped = row("COSC", "1", "1", 30, 30);
        scraped.instructor = "New Instructor".to_string();
        let batch = plan_batch(vec![scraped], "202501", &existing);
        assert_eq!(batch.updates[0].instructor, "New Instructor");
        assert!(batch.changes.is_empty());
    }

    #[test]
    fn other_terms_are_skipped_and_blank_terms_adopted() {
        let mut foreign = row("MATH", "3", "1", 10, 1);
        foreign.term = "202409".to_string();
        let mut blank = row("MATH", "8", "1", 10, 1);
        blank.term.clear();
        let batch = plan_batch(vec![foreign, blank], "202501", &[]);
        assert_eq!(batch.skipped, 1);
        assert_eq!(batch.creates.len(), 1);
        assert_eq!(batch.creates[0].term, "202501");
    }

    #[test]
    fn repeated_keys_keep_the_last_row() {
        let batch = plan_batch(
            vec![row("COSC", "1", "1", 30, 10), row("COSC", "1", "1", 30, 12)],
            "202501",
            &[],
        );
        assert_eq!(batch.creates.len(), 1);
        assert_eq!(batch.creates[0].enrollment, 12);
    }

    #[test]
    fn operations_follow_natural_course_order() {
        let batch = plan_batch(
            vec![
                row("COSC", "10", "1", 0, 0),
                row("COSC", "2", "1", 0, 0),
                row("ANTH", "69.12", "1", 0, 0),
                row("COSC", "2", "01", 0, 0),
                row("ANTH", "69.2", "1", 0, 0),
            ],
            "202501",
            &[],
        );
        let keys: Vec<String> = batch.creates.iter().map(|r| r.key().to_string()).collect();
        assert_eq!(
            keys,
            vec!["ANTH 69.12 1", "ANTH 69.2 1", "COSC 2 01", "COSC 2 1", "COSC 10 1"]
        );
    }

    #[tokio::test]
    async fn reconciling_the_same_snapshot_twice_is_stable() {
        let store = Arc::new(MemoryStore::new());
        let reconciler = DataReconciler::new(store.clone());
        let snapshot = vec![row("COSC", "1", "1", 30, 30), row("COSC", "10", "2", 60, 42)];

        let first = reconciler.reconcile(snapshot.clone(), "202501", Utc::now()).await.unwrap();
        assert_eq!(first.creates.len(), 2);

        let second = reconciler.reconcile(snapshot, "202501", Utc::now()).await.unwrap();
        assert!(second.creates.is_empty());
        assert_eq!(second.updates.len(), 2);
        assert!(second.changes.is_empty());
        assert_eq!(store.course_count().await, 2);
        assert!(store.history().await.is_empty());
    }

    #[tokio::test]
    async fn changes_are_written_to_history() {
        let store = Arc::new(MemoryStore::new());
        store.insert_course(stored(row("COSC", "1", "1", 30, 30))).await;
        let reconciler = DataReconciler::new(store.clone());

        let batch = reconciler
            .reconcile(vec![row("COSC", "1", "1", 30, 25)], "202501", Utc::now())
            .await
            .unwrap();

        assert_eq!(batch.changes.len(), 1);
        let history = store.history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].enrollment, 25);
        let courses = store.courses_for_term("202501").await.unwrap();
        assert_eq!(courses[0].row.enrollment, 25);
    }
}
