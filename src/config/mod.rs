pub mod schema;

pub use schema::{
    join_url, AdetailerConfig, BackendConfig, CharacterConfig, ChatConfig, CommandsConfig, Config,
    GenerationConfig, HiresConfig, LaunchConfig, MessagesConfig, PermissionsConfig, Resolution,
    ResolutionsConfig, RuntimeConfig, SpeechConfig, TextGenerationConfig,
};
