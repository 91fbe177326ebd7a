/// Token usage accumulated over every `response.done` seen by a client.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Stats {
    responses: u32,
    total_tokens: i64,
    input_tokens: i64,
    output_tokens: i64,
}

impl Stats {
    pub(crate) fn update_usage(&mut self, total: i32, input: i32, output: i32) {
        self.responses += 1;
        self.total_tokens += i64::from(total);
        self.input_tokens += i64::from(input);
        self.output_tokens += i64::from(output);
    }

    pub fn responses(&self) -> u32 {
        self.responses
    }

    pub fn total_tokens(&self) -> i64 {
        self.total_tokens
    }

    pub fn input_tokens(&self) -> i64 {
        self.input_tokens
    }

    pub fn output_tokens(&self) -> i64 {
        self.output_tokens
    }
}
