pub mod backoff_util;

use std::future::Future;
use std::pin::Pin;

/// A boxed future that is `Send`
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
