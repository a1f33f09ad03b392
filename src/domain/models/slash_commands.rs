#[cfg(test)]
#[path = "slash_commands_test.rs"]
mod tests;

pub struct SlashCommand {
    command: String,
}

impl SlashCommand {
    pub fn parse(text: &str) -> Option<SlashCommand> {
        let Some(prefix) = text.split_whitespace().next() else {
            return None;
        };

        let cmd = SlashCommand {
            command: prefix.to_string(),
        };
        if cmd.is_quit()
            || cmd.is_new_chat()
            || cmd.is_reset_chat()
            || cmd.is_regenerate()
            || cmd.is_resume()
            || cmd.is_help()
        {
            return Some(cmd);
        }

        return None;
    }

    pub fn is_quit(&self) -> bool {
        return ["/q", "/quit", "/exit"].contains(&self.command.as_str());
    }

    pub fn is_new_chat(&self) -> bool {
        return ["/n", "/new"].contains(&self.command.as_str());
    }

    pub fn is_reset_chat(&self) -> bool {
        return ["/reset"].contains(&self.command.as_str());
    }

    pub fn is_regenerate(&self) -> bool {
        return ["/r", "/regenerate"].contains(&self.command.as_str());
    }

    pub fn is_resume(&self) -> bool {
        return ["/resume"].contains(&self.command.as_str());
    }

    pub fn is_help(&self) -> bool {
        return ["/h", "/help"].contains(&self.command.as_str());
    }
}
