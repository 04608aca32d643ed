use std::collections::BTreeMap;
use std::sync::Arc;

use doorface_vision::{FaceClassifier, Label};
use log::info;

use crate::error::Result;
use crate::store::{IdentityStore, OwnerRef};

/// Label to identity-slot mapping produced by one training pass.
///
/// Labels are dense from 0 and only meaningful within the pass that issued
/// them. A session keeps its own copy and never sees later store changes.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelMap {
    owners: BTreeMap<Label, OwnerRef>,
    revision: u64,
}

impl LabelMap {
    pub fn owner(&self, label: Label) -> Option<&OwnerRef> {
        self.owners.get(&label)
    }

    /// Every label whose slot belongs to `account`: its owner's face and the
    /// faces of all of its members.
    pub fn labels_for(&self, account: &str) -> Vec<Label> {
        self.owners
            .iter()
            .filter(|(_, owner)| owner.account == account)
            .map(|(label, _)| *label)
            .collect()
    }

    /// Store revision the map was built from.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn is_current(&self, store: &IdentityStore) -> bool {
        store.revision() == self.revision
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Training {
    Trained(LabelMap),
    /// No template exists anywhere in the store.
    Empty,
}

/// Rebuilds the classifier from every template in the store.
#[derive(Clone)]
pub struct ClassifierTrainer {
    store: Arc<IdentityStore>,
}

impl ClassifierTrainer {
    pub fn new(store: Arc<IdentityStore>) -> Self {
        Self { store }
    }

    pub fn rebuild(&self, classifier: &mut dyn FaceClassifier) -> Result<Training> {
        // Revision read before the snapshot; a concurrent mutation makes the
        // map look stale rather than current.
        let revision = self.store.revision();
        let templates = self.store.templates()?;
        if templates.is_empty() {
            info!("no enrolled faces to train on");
            return Ok(Training::Empty);
        }

        let mut owners = BTreeMap::new();
        let mut samples = Vec::with_capacity(templates.len());
        for (label, (owner, template)) in (0..).zip(templates) {
            owners.insert(label, owner);
            samples.push((template, label));
        }

        classifier.train(&samples)?;
        let map = LabelMap { owners, revision };
        info!(
            "trained classifier on {} face(s) at store revision {}",
            samples.len(),
            map.revision()
        );

        Ok(Training::Trained(map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result as AnyResult;
    use doorface_vision::Prediction;
    use image::GrayImage;

    #[derive(Default)]
    struct Recording {
        trained: Vec<Label>,
    }

    impl FaceClassifier for Recording {
        fn train(&mut self, samples: &[(GrayImage, Label)]) -> AnyResult<()> {
            self.trained = samples.iter().map(|(_, l)| *l).collect();
            Ok(())
        }

        fn predict(&self, _template: &GrayImage) -> AnyResult<Prediction> {
            anyhow::bail!("not used")
        }
    }

    fn face() -> GrayImage {
        GrayImage::from_fn(24, 24, |x, y| image::Luma([(x * 7 + y * 3) as u8]))
    }

    fn setup() -> (tempfile::TempDir, Arc<IdentityStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(IdentityStore::open(dir.path().join("faces")).unwrap());
        (dir, store)
    }

    #[test]
    fn empty_store_is_sentinel() {
        let (_dir, store) = setup();
        store.create_account("alice", "pw", "Alice", "Smith").unwrap();

        let mut classifier = Recording::default();
        let outcome = ClassifierTrainer::new(store).rebuild(&mut classifier).unwrap();
        assert_eq!(outcome, Training::Empty);
        assert!(classifier.trained.is_empty());
    }

    #[test]
    fn labels_are_dense_and_members_map_to_owner_account() {
        let (_dir, store) = setup();
        store.create_account("alice", "pw", "Alice", "Smith").unwrap();
        store.create_account("zed", "pw", "Zed", "Moe").unwrap();
        store.add_member("alice", "bob").unwrap();
        store.store_template(&OwnerRef::owner("alice"), &face()).unwrap();
        store
            .store_template(&OwnerRef::member("alice", "bob"), &face())
            .unwrap();
        store.store_template(&OwnerRef::owner("zed"), &face()).unwrap();

        let mut classifier = Recording::default();
        let map = match ClassifierTrainer::new(store.clone())
            .rebuild(&mut classifier)
            .unwrap()
        {
            Training::Trained(map) => map,
            Training::Empty => panic!("expected a trained map"),
        };

        assert_eq!(classifier.trained, vec![0, 1, 2]);
        assert!(map.owner(2).is_some());
        assert!(map.owner(3).is_none());
        assert_eq!(map.revision(), store.revision());

        let alice = map.labels_for("alice");
        assert_eq!(alice.len(), 2);
        assert!(alice
            .iter()
            .any(|l| map.owner(*l) == Some(&OwnerRef::member("alice", "bob"))));
        assert_eq!(map.labels_for("zed").len(), 1);
        assert!(map.labels_for("nobody").is_empty());
        assert!(map.is_current(&store));
    }

    #[test]
    fn snapshot_goes_stale_after_delete() {
        let (_dir, store) = setup();
        store.create_account("alice", "pw", "Alice", "Smith").unwrap();
        store.store_template(&OwnerRef::owner("alice"), &face()).unwrap();

        let trainer = ClassifierTrainer::new(store.clone());
        let Training::Trained(map) = trainer.rebuild(&mut Recording::default()).unwrap() else {
            panic!("expected a trained map");
        };

        store.delete_account("alice").unwrap();
        assert!(!map.is_current(&store));
        // the snapshot itself is unchanged
        assert_eq!(map.labels_for("alice"), vec![0]);
        assert_eq!(
            trainer.rebuild(&mut Recording::default()).unwrap(),
            Training::Empty
        );
    }
}
