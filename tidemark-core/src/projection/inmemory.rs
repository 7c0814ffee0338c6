//! In-memory projection store implementation.

use std::{
    collections::BTreeMap,
    convert::Infallible,
    future::Future,
    sync::{Arc, RwLock},
};

use super::{DurableProjectionStore, Page, Projection, ProjectionFilter};

type SharedProjections = Arc<RwLock<BTreeMap<String, Projection>>>;

/// In-memory projection store backed by an ordered map, so queries paginate
/// in stable id order.
#[derive(Clone, Debug, Default)]
pub struct Store {
    projections: SharedProjections,
}

impl Store {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.projections
            .read()
            .expect("projection store lock poisoned")
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DurableProjectionStore for Store {
    type Error = Infallible;

    fn get(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<Option<Projection>, Self::Error>> + Send + '_ {
        let found = self
            .projections
            .read()
            .expect("projection store lock poisoned")
            .get(id)
            .cloned();
        std::future::ready(Ok(found))
    }

    fn save(
        &self,
        projection: Projection,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        self.projections
            .write()
            .expect("projection store lock poisoned")
            .insert(projection.id.clone(), projection);
        std::future::ready(Ok(()))
    }

    fn delete(&self, id: &str) -> impl Future<Output = Result<(), Self::Error>> + Send + '_ {
        self.projections
            .write()
            .expect("projection store lock poisoned")
            .remove(id);
        std::future::ready(Ok(()))
    }

    fn query<'a>(
        &'a self,
        filter: &'a ProjectionFilter,
        page: &'a Page,
    ) -> impl Future<Output = Result<Vec<Projection>, Self::Error>> + Send + 'a {
        let matches: Vec<Projection> = self
            .projections
            .read()
            .expect("projection store lock poisoned")
            .values()
            .filter(|p| filter.matches(p))
            .skip(page.offset)
            .take(page.limit)
            .cloned()
            .collect();
        std::future::ready(Ok(matches))
    }

    fn count<'a>(
        &'a self,
        filter: &'a ProjectionFilter,
    ) -> impl Future<Output = Result<usize, Self::Error>> + Send + 'a {
        let count = self
            .projections
            .read()
            .expect("projection store lock poisoned")
            .values()
            .filter(|p| filter.matches(p))
            .count();
        std::future::ready(Ok(count))
    }
}
