//! Category taxonomy.
//!
//! The taxonomy is the closed set of categories mail can be sorted into. It
//! is built once from configuration and never changes while the engine
//! runs. Anything that names a category from the outside (remote labels,
//! persisted cache entries and rules) is validated against it with
//! [`Taxonomy::resolve`].
//!
//! One category is always the designated default (`UNKNOWN`): it has no
//! folder and a zero threshold, and it is what every path falls back to
//! when nothing clears a threshold.

mod model;

use std::collections::HashMap;

pub use model::{Category, CategoryName, DEFAULT_CATEGORY, DEFAULT_THRESHOLD, default_categories};

use crate::{Error, Result};

/// Closed, ordered set of categories.
#[derive(Debug, Clone)]
pub struct Taxonomy {
    categories: Vec<Category>,
    index: HashMap<CategoryName, usize>,
    default: usize,
}

impl Taxonomy {
    /// Build a taxonomy from configured categories.
    ///
    /// The default `UNKNOWN` category is appended unless it is configured
    /// explicitly, in which case it must have a zero threshold.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an empty set, duplicate names, empty
    /// names, or thresholds outside `[0, 1]`.
    pub fn new(categories: Vec<Category>) -> Result<Self> {
        if categories.is_empty() {
            return Err(Error::Config("taxonomy has no categories".into()));
        }

        let mut all = categories;
        let default_name = CategoryName::new(DEFAULT_CATEGORY);
        if !all.iter().any(|c| c.name == default_name) {
            all.push(
                Category::new(DEFAULT_CATEGORY, None)
                    .threshold(0.0)
                    .description("Mail no rule, cache entry or classifier could place"),
            );
        }

        let mut index = HashMap::with_capacity(all.len());
        for (position, category) in all.iter().enumerate() {
            if category.name.as_str().is_empty() {
                return Err(Error::Config("category with empty name".into()));
            }
            if !(0.0..=1.0).contains(&category.threshold) {
                return Err(Error::Config(format!(
                    "category {} has threshold {} outside [0, 1]",
                    category.name, category.threshold
                )));
            }
            if index.insert(category.name.clone(), position).is_some() {
                return Err(Error::Config(format!(
                    "duplicate category {}",
                    category.name
                )));
            }
        }

        let default = index[&default_name];
        if all[default].threshold > 0.0 {
            return Err(Error::Config(format!(
                "default category {DEFAULT_CATEGORY} must have a zero threshold"
            )));
        }

        Ok(Self {
            categories: all,
            index,
            default,
        })
    }

    /// Validate a raw label against the taxonomy.
    ///
    /// Matching ignores case and surrounding whitespace or quotes.
    #[must_use]
    pub fn resolve(&self, label: &str) -> Option<CategoryName> {
        let name = CategoryName::new(label);
        self.index.contains_key(&name).then_some(name)
    }

    /// Look up a category by name.
    #[must_use]
    pub fn get(&self, name: &CategoryName) -> Option<&Category> {
        self.index.get(name).map(|&i| &self.categories[i])
    }

    /// Whether the name belongs to the taxonomy.
    #[must_use]
    pub fn contains(&self, name: &CategoryName) -> bool {
        self.index.contains_key(name)
    }

    /// The fallback category.
    #[must_use]
    pub fn default_category(&self) -> &Category {
        &self.categories[self.default]
    }

    /// Name of the fallback category.
    #[must_use]
    pub fn default_name(&self) -> &CategoryName {
        &self.categories[self.default].name
    }

    /// Whether `name` is the fallback category.
    #[must_use]
    pub fn is_default(&self, name: &CategoryName) -> bool {
        self.default_name() == name
    }

    /// Whether `confidence` is enough to accept a result in `name`.
    ///
    /// Unknown names are never accepted.
    #[must_use]
    pub fn accepts(&self, name: &CategoryName, confidence: f64) -> bool {
        self.get(name).is_some_and(|c| c.accepts(confidence))
    }

    /// Tie-break priority of a category (0 for unknown names).
    #[must_use]
    pub fn priority(&self, name: &CategoryName) -> i32 {
        self.get(name).map_or(0, |c| c.priority)
    }

    /// Destination folder of a category, if it has one.
    #[must_use]
    pub fn folder(&self, name: &CategoryName) -> Option<&str> {
        self.get(name).and_then(|c| c.folder.as_deref())
    }

    /// The category whose destination folder is `folder`.
    #[must_use]
    pub fn for_folder(&self, folder: &str) -> Option<&Category> {
        self.categories
            .iter()
            .find(|c| c.folder.as_deref() == Some(folder))
    }

    /// Labels the remote classifier may answer with (default excluded).
    #[must_use]
    pub fn vocabulary(&self) -> Vec<String> {
        self.assignable().map(|c| c.name.to_string()).collect()
    }

    /// Categories other than the default.
    pub fn assignable(&self) -> impl Iterator<Item = &Category> {
        self.categories
            .iter()
            .enumerate()
            .filter(move |(i, _)| *i != self.default)
            .map(|(_, c)| c)
    }

    /// All categories, default included, in configuration order.
    pub fn iter(&self) -> impl Iterator<Item = &Category> {
        self.categories.iter()
    }

    /// Number of categories, default included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.categories.len()
    }

    /// Always `false`; a taxonomy holds at least the default category.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }
}

impl Default for Taxonomy {
    fn default() -> Self {
        let categories = default_categories();
        let mut index = HashMap::new();
        let mut all = categories;
        all.push(
            Category::new(DEFAULT_CATEGORY, None)
                .threshold(0.0)
                .description("Mail no rule, cache entry or classifier could place"),
        );
        for (position, category) in all.iter().enumerate() {
            index.insert(category.name.clone(), position);
        }
        let default = all.len() - 1;
        Self {
            categories: all,
            index,
            default,
        }
    }
}
