use std::future::Future;

use serde::{Serialize, de::DeserializeOwned};

/// The `Fetcher` produces fresh resource values when a key is missing from the cache or needs to be revalidated.
///
/// A fetcher is usually a thin wrapper around an HTTP client:
/// ```
/// use serde::{Deserialize, Serialize};
///
/// # #[derive(Debug)] struct ApiError;
/// # impl std::fmt::Display for ApiError {
/// # 	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
/// # 		f.write_str("api error")
/// # 	}
/// # }
/// # impl std::error::Error for ApiError {}
/// #[derive(Clone, Debug, Serialize, Deserialize)]
/// struct Lookup {
/// 	path: String,
/// 	page: u32
/// }
///
/// #[derive(Serialize, Deserialize)]
/// struct Todos(Vec<String>);
///
/// struct Api;
/// impl sswr::Fetcher for Api {
/// 	type Args = Lookup;
/// 	type Data = Todos;
/// 	type Error = ApiError;
///
/// 	async fn fetch(&self, args: &Lookup) -> Result<Todos, ApiError> {
/// 		# let _ = stringify! {
/// 		...
/// 		# };
/// 		# Ok(Todos(vec![args.path.clone()]))
/// 	}
/// }
/// ```
///
/// The cache serializes `Args` into the entry key (see [`key`](crate::key)) and hands the decoded arguments back to
/// [`Fetcher::fetch`] when a revalidation actually runs. Both `Args` and `Data` must therefore be JSON-expressible;
/// `Data` additionally round-trips through the [persistent store](crate::PersistentStore) when one is configured.
pub trait Fetcher: Send + Sync + 'static {
	/// The fetch arguments a key is built from.
	type Args: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;

	/// The resource value this fetcher produces.
	type Data: Serialize + DeserializeOwned + Send + Sync + 'static;

	/// The error type returned when a fetch fails.
	type Error: std::error::Error + Send + Sync + 'static;

	/// Fetches the resource described by `args`.
	fn fetch(&self, args: &Self::Args) -> impl Future<Output = Result<Self::Data, Self::Error>> + Send;
}
