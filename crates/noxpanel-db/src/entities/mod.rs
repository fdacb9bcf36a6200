pub mod plugin;
pub mod plugin_collection;
pub mod plugin_download;
pub mod plugin_rating;
