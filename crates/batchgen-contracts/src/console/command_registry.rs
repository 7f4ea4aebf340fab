#[derive(Clone, Copy, Debug)]
pub(crate) struct CommandSpec {
    pub command: &'static str,
    pub action: &'static str,
    /// Positional argument keys, in order.
    pub args: &'static [&'static str],
    /// When set, the last key swallows the raw remainder of the line.
    pub rest: bool,
}

const fn spec(
    command: &'static str,
    action: &'static str,
    args: &'static [&'static str],
    rest: bool,
) -> CommandSpec {
    CommandSpec {
        command,
        action,
        args,
        rest,
    }
}

pub(crate) const COMMANDS: &[CommandSpec] = &[
    spec("help", "help", &[], false),
    spec("quit", "quit", &[], false),
    spec("exit", "quit", &[], false),
    spec("import", "import", &["path"], false),
    spec("batches", "list_batches", &[], false),
    spec("remove", "remove_batch", &["batch"], false),
    spec("prompt", "set_prompt", &["batch", "prompt"], true),
    spec("add_image", "add_image", &["batch", "path"], false),
    spec("replace_image", "replace_image", &["batch", "index", "path"], false),
    spec("remove_image", "remove_image", &["batch", "index"], false),
    spec("outputs", "set_outputs", &["count"], false),
    spec("run", "run_batch", &["batch", "tier"], false),
    spec("run_all", "run_all", &["tier"], false),
    spec("stop", "stop_batch", &["batch"], false),
    spec("stop_all", "stop_all", &[], false),
    spec("resume", "resume", &[], false),
    spec("edit", "open_editor", &["batch", "tier", "index"], false),
    spec("regen", "regenerate", &["prompt"], true),
    spec("undo", "undo", &[], false),
    spec("redo", "redo", &[], false),
    spec("apply_all", "apply_all", &[], false),
    spec("close", "close_editor", &[], false),
    spec("save", "save_result", &["batch", "tier", "index", "dir"], false),
    spec("export", "export", &["path"], false),
];

pub const CONSOLE_HELP_COMMANDS: &[&str] = &[
    "/import <folder>",
    "/batches",
    "/remove <batch>",
    "/prompt <batch> [text]",
    "/add_image <batch> <path>",
    "/replace_image <batch> <index> <path>",
    "/remove_image <batch> <index>",
    "/outputs <1-10>",
    "/run <batch> [normal|pro]",
    "/run_all [normal|pro]",
    "/stop <batch>",
    "/stop_all",
    "/resume",
    "/edit <batch> <normal|pro> <index>",
    "/regen <prompt>",
    "/undo",
    "/redo",
    "/apply_all",
    "/close",
    "/save <batch> <normal|pro> <index> [dir]",
    "/export [dir]",
    "/quit",
];
