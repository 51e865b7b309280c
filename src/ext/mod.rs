mod path_ext;

pub use path_ext::{
    PathDisplayExt, contains_path, display_best_effort, join_relative, normalize_lexically,
};
