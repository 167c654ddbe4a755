/*
 * Copyright 2025 Carver Automation Corporation.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "serviceradar-platform-sync")]
#[command(about = "ServiceRadar real-time backend synchronization layer")]
#[command(version)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short = 'c', long = "config", value_name = "FILE", env = "PLATFORM_SYNC_CONFIG")]
    pub config: Option<String>,

    /// Generate example configuration file
    #[arg(long = "generate-config")]
    pub generate_config: bool,

    /// Enable debug logging
    #[arg(short = 'd', long = "debug")]
    pub debug: bool,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flags() {
        let cli = Cli::parse_from(["serviceradar-platform-sync", "-c", "/tmp/sync.toml", "--debug"]);
        assert_eq!(cli.config.as_deref(), Some("/tmp/sync.toml"));
        assert!(cli.debug);
        assert!(!cli.generate_config);
    }
}
