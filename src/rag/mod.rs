pub mod cache;
pub mod embeddings;
pub mod generation;
pub mod ingestion;
pub mod ivf;
pub mod retrieval;
pub mod retry;
pub mod vector_index;
pub mod vector_store;

#[cfg(test)]
pub(crate) mod test_support;
