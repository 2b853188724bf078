pub const INITIALIZE: &str = "initialize";
pub const SESSION_NEW: &str = "session/new";
pub const SESSION_PROMPT: &str = "session/prompt";
pub const SESSION_CANCEL: &str = "session/cancel";
pub const SESSION_UPDATE: &str = "session/update";

pub const FS_READ_TEXT_FILE: &str = "fs/read_text_file";
pub const FS_WRITE_TEXT_FILE: &str = "fs/write_text_file";

pub const TERMINAL_CREATE: &str = "terminal/create";
pub const TERMINAL_OUTPUT: &str = "terminal/output";
pub const TERMINAL_WAIT_FOR_EXIT: &str = "terminal/wait_for_exit";
pub const TERMINAL_KILL: &str = "terminal/kill";
pub const TERMINAL_RELEASE: &str = "terminal/release";

pub const PERMISSION_REQUEST: &str = "permission/request";

// Extension methods, prefixed with `_` so plain ACP peers ignore them.
pub const TOOLS_LIST: &str = "_bridge/tools/list";
pub const TOOLS_CALL: &str = "_bridge/tools/call";

/// Methods an Agent serves.
pub const AGENT_METHODS: &[&str] = &[INITIALIZE, SESSION_NEW, SESSION_PROMPT, SESSION_CANCEL];

/// Methods a Client serves.
pub const CLIENT_METHODS: &[&str] = &[
    INITIALIZE,
    SESSION_UPDATE,
    FS_READ_TEXT_FILE,
    FS_WRITE_TEXT_FILE,
    TERMINAL_CREATE,
    TERMINAL_OUTPUT,
    TERMINAL_WAIT_FOR_EXIT,
    TERMINAL_KILL,
    TERMINAL_RELEASE,
    PERMISSION_REQUEST,
    TOOLS_LIST,
    TOOLS_CALL,
];
