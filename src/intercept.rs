use std::{collections::HashMap, future::Future};

use dynosaur::dynosaur;

#[dynosaur(pub(crate) DynIntercept = dyn(box) Intercept)]
/// Serves scripts for selected URLs without contacting the origin.
///
/// Consulted for every request before any upstream connection is made.
/// Returning `None` or an empty script lets the request through to the origin.
pub trait Intercept: Send + Sync {
    /// Returns the script to serve for the raw request `url`, if any.
    fn intercept<'a>(&'a self, url: &'a str) -> impl Future<Output = Option<String>> + Send + 'a;
}

/// Serves fixed scripts for exact request URLs.
#[derive(Debug, Default, Clone)]
pub struct StaticScripts(HashMap<String, String>);

impl StaticScripts {
    /// Adds a script served for `url`.
    pub fn insert(mut self, url: impl Into<String>, script: impl Into<String>) -> Self {
        self.0.insert(url.into(), script.into());
        self
    }
}

impl FromIterator<(String, String)> for StaticScripts {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Intercept for StaticScripts {
    async fn intercept<'a>(&'a self, url: &'a str) -> Option<String> {
        self.0.get(url).cloned()
    }
}

/// Creates an [`Intercept`] from a synchronous closure.
pub fn from_fn<F>(f: F) -> InterceptFn<F>
where
    F: Fn(&str) -> Option<String> + Send + Sync,
{
    InterceptFn(f)
}

/// Interceptor returned by [`from_fn`].
#[derive(Clone)]
pub struct InterceptFn<F>(F);

impl<F> Intercept for InterceptFn<F>
where
    F: Fn(&str) -> Option<String> + Send + Sync,
{
    async fn intercept<'a>(&'a self, url: &'a str) -> Option<String> {
        (self.0)(url)
    }
}
