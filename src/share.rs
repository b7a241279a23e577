use crate::registry::SessionCode;
use std::fmt;
use url::Url;

/// Представление кода для шаринга: чистый форматтер {host, code} -> URL.
/// QR-код и диалог «поделиться» рисует фронтенд поверх этой же строки.
#[derive(Debug, Clone)]
pub struct ShareLink {
    host: String,
    code: SessionCode,
}

impl ShareLink {
    pub fn new(host: String, code: SessionCode) -> Self {
        Self { host, code }
    }

    pub fn url(&self) -> String {
        format!("https://{}/share?code={}", self.host, self.code)
    }

    pub fn code(&self) -> &SessionCode {
        &self.code
    }

    /// Достаёт код из пользовательского ввода: полная share-ссылка
    /// или голый код. Структуру самого кода не разбирает — он непрозрачен.
    pub fn extract_code(input: &str) -> Option<String> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return None;
        }
        if let Ok(parsed) = Url::parse(trimmed) {
            return parsed
                .query_pairs()
                .find(|(key, _)| key == "code")
                .map(|(_, value)| value.into_owned());
        }
        Some(trimmed.to_string())
    }
}

impl fmt::Display for ShareLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code(s: &str) -> SessionCode {
        SessionCode::parse(s, s.len()).unwrap()
    }

    #[test]
    fn url_matches_share_dialog_shape() {
        let link = ShareLink::new("zippy-two.vercel.app".into(), code("K7QX"));
        assert_eq!(link.url(), "https://zippy-two.vercel.app/share?code=K7QX");
        assert_eq!(link.to_string(), link.url());
    }

    #[test]
    fn extract_code_from_full_link() {
        assert_eq!(
            ShareLink::extract_code("https://zippy-two.vercel.app/share?code=K7QX"),
            Some("K7QX".into())
        );
        // лишние параметры не мешают
        assert_eq!(
            ShareLink::extract_code("https://example.org/share?theme=dark&code=ABCD"),
            Some("ABCD".into())
        );
    }

    #[test]
    fn extract_code_from_bare_input() {
        assert_eq!(ShareLink::extract_code("  K7QX \n"), Some("K7QX".into()));
        assert_eq!(ShareLink::extract_code(""), None);
    }

    #[test]
    fn link_without_code_param_yields_nothing() {
        assert_eq!(
            ShareLink::extract_code("https://zippy-two.vercel.app/share"),
            None
        );
    }
}
