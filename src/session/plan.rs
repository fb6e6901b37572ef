use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{Backend, CaptureConfig, ProfileConfig};

use super::error::SessionError;
use super::readiness::Marker;

const NAME_PLACEHOLDER: &str = "{name}";

/// What to stream: a configured profile plus the identifier substituted
/// into its argv (e.g. the trunk config `okwin`, or a frequency).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSpec {
    pub profile: String,
    pub name: String,
}

/// A profile resolved against one request, ready to execute.
#[derive(Debug, Clone)]
pub struct SessionPlan {
    pub label: String,
    pub display_name: String,
    pub backend: Backend,
    pub decoder_argv: Vec<String>,
    pub player_argv: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub markers: Vec<Marker>,
    pub ready_description: String,
    pub settle: Duration,
    pub ready_timeout: Option<Duration>,
    pub capture: CaptureConfig,
    pub presence_url: String,
}

impl SessionPlan {
    pub fn build(
        profiles: &HashMap<String, ProfileConfig>,
        spec: &SourceSpec,
    ) -> Result<Self, SessionError> {
        let profile = profiles
            .get(&spec.profile)
            .ok_or_else(|| SessionError::UnknownProfile(spec.profile.clone()))?;
        if !is_valid_name(&spec.name) {
            return Err(SessionError::InvalidName(spec.name.clone()));
        }

        Ok(Self {
            label: profile.label.clone(),
            display_name: spec.name.to_uppercase(),
            backend: profile.backend,
            decoder_argv: substitute(&profile.decoder_argv, &spec.name),
            player_argv: substitute(&profile.player_argv, &spec.name),
            working_dir: profile.working_dir.as_ref().map(PathBuf::from),
            markers: profile.markers.clone(),
            ready_description: profile.ready_description.clone(),
            settle: Duration::from_millis(profile.settle_ms),
            ready_timeout: (profile.ready_timeout_ms > 0)
                .then(|| Duration::from_millis(profile.ready_timeout_ms)),
            capture: profile.capture.clone(),
            presence_url: profile.presence_url.clone(),
        })
    }
}

pub fn substitute(template: &[String], name: &str) -> Vec<String> {
    template
        .iter()
        .map(|arg| arg.replace(NAME_PLACEHOLDER, name))
        .collect()
}

// 名字会拼进文件名参数，不允许路径分隔符和选项前缀
fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && name != "."
        && name != ".."
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::readiness::MarkerStage;

    fn profiles() -> HashMap<String, ProfileConfig> {
        let profile = ProfileConfig {
            backend: Backend::Decoder,
            label: "OP25".into(),
            presence_url: "https://github.com/boatbod/op25".into(),
            working_dir: Some("/opt/op25/apps".into()),
            decoder_argv: vec![
                "rx.py".into(),
                "--trunk-conf-file".into(),
                "{name}.tsv".into(),
                "--nocrypt".into(),
            ],
            player_argv: Vec::new(),
            ready_description: "NAC".into(),
            markers: vec![Marker::ready("Reconfiguring NAC")],
            settle_ms: 250,
            ready_timeout_ms: 0,
            capture: CaptureConfig { device: "hw:2,0".into(), sample_rate: 44_100, channels: 1 },
        };
        HashMap::from([("op25".to_string(), profile)])
    }

    fn spec(profile: &str, name: &str) -> SourceSpec {
        SourceSpec { profile: profile.into(), name: name.into() }
    }

    #[test]
    fn substitutes_name_into_argv() {
        let plan = SessionPlan::build(&profiles(), &spec("op25", "okwin")).unwrap();
        assert_eq!(plan.decoder_argv, vec!["rx.py", "--trunk-conf-file", "okwin.tsv", "--nocrypt"]);
        assert_eq!(plan.display_name, "OKWIN");
        assert_eq!(plan.settle, Duration::from_millis(250));
        assert_eq!(plan.ready_timeout, None);
        assert_eq!(plan.markers[0].stage, MarkerStage::Ready);
        assert_eq!(plan.working_dir, Some(PathBuf::from("/opt/op25/apps")));
    }

    #[test]
    fn unknown_profile_is_rejected() {
        let err = SessionPlan::build(&profiles(), &spec("p25", "okwin")).unwrap_err();
        assert!(matches!(err, SessionError::UnknownProfile(p) if p == "p25"));
    }

    #[test]
    fn names_cannot_escape_the_argument() {
        for bad in ["", "../etc/passwd", "-x", "a b", "..", "ok;rm"] {
            assert!(
                matches!(
                    SessionPlan::build(&profiles(), &spec("op25", bad)),
                    Err(SessionError::InvalidName(_))
                ),
                "{bad:?} should be rejected"
            );
        }
        assert!(SessionPlan::build(&profiles(), &spec("op25", "99.5M")).is_ok());
    }
}
