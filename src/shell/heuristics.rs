use once_cell::sync::Lazy;
use regex::Regex;

/// How many trailing lines are inspected for a prompt
pub const PROMPT_TAIL_LINES: usize = 5;

/// What shells look like right before they block for input, most specific
/// first. Matched against trimmed lines.
static PROMPT_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // (venv) user@host:~/project$
        r"\(venv\).+[$#] ?$",
        // root@container:~#
        r"root@[^:]+:[^#]+# ?$",
        // user@host:~$
        r"[a-zA-Z0-9_.-]+@[^:]+:[^$#]+[$#] ?$",
        // C:\path>
        r"[A-Z]:\\[^>]*> ?$",
        // C:>
        r"[A-Z]:[^>]*> ?$",
        // PS C:\path>
        r"PS [A-Z]:\\[^>]*> ?$",
        // PS>
        r"PS [^>]*> ?$",
        // WSL user@host:/mnt/c$
        r"[a-zA-Z0-9_.-]+@[^:]+:/[^$]+ ?[$#] ?$",
        // WSL user@host:~$
        r"[a-zA-Z0-9_.-]+@[^:]+:~[$#] ?$",
        // anything ending with $, # or >
        r"[$#>] ?$",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).unwrap())
    .collect()
});

/// CSI and OSC escape sequences emitted by shells attached to a pty
static RE_ANSI: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]").unwrap()
});

/// Remove terminal escape sequences and carriage returns.
pub fn strip_ansi(text: &str) -> String {
    RE_ANSI.replace_all(text, "").replace('\r', "")
}

/// Recognizes an idle shell prompt at the end of command output
pub struct PromptDetector;

impl PromptDetector {
    /// Return the first of the last few lines that looks like a prompt.
    ///
    /// Output that merely resembles a prompt (`a > b`, a line ending in `#`)
    /// matches too; callers treat a hit as "probably done".
    pub fn find_prompt(content: &str) -> Option<String> {
        let clean = strip_ansi(content);
        let lines: Vec<&str> = clean.lines().collect();
        let start = lines.len().saturating_sub(PROMPT_TAIL_LINES);

        lines[start..]
            .iter()
            .map(|line| line.trim())
            .filter(|line| !line.is_empty())
            .find(|line| PROMPT_PATTERNS.iter().any(|re| re.is_match(line)))
            .map(str::to_string)
    }

    #[cfg(test)]
    pub fn is_prompt(line: &str) -> bool {
        let line = line.trim();
        !line.is_empty() && PROMPT_PATTERNS.iter().any(|re| re.is_match(line))
    }
}
