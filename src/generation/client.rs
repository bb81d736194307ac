//! Generator configuration

/// Configuration for the subprocess generator
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    /// Program to spawn for each generation call
    pub program: String,

    /// Arguments placed before the prompt
    pub args: Vec<String>,

    /// Timeout for a single call in seconds
    pub timeout_secs: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            program: "adflow-generate".to_string(),
            args: Vec::new(),
            timeout_secs: 30,
        }
    }
}

impl GeneratorConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Parse a shell-like command line (`"llm --model small"`) into program and args
    pub fn from_command_line(command: &str) -> Option<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
            ..Self::default()
        })
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }
}
