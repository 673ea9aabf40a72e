//! The configuration model and its nginx-like textual grammar parser.
//!
//! `ConfigParser` is grounded on `Config::parseFile`/`parseServerBlock`/
//! `parseLocationBlock` from the original C++ implementation: a hand-rolled,
//! line-oriented recursive descent over `server { ... }` blocks holding
//! nested `location PREFIX { ... }` blocks. The error type follows the
//! teacher's `quick_error!` taxonomy (`server::error::RequestError`), here
//! specialized to configuration parsing per §9's "dedicated error kind,
//! not exceptions" design note.

use std::fs;
use std::path::{Path, PathBuf};

use quick_error::quick_error;

quick_error! {
    #[derive(Debug)]
    pub enum ConfigParseError {
        Io(err: std::io::Error) {
            from()
            description("error reading configuration file")
            display("error reading configuration file: {}", err)
        }
        Syntax(line: usize, message: String) {
            description("syntax error in configuration file")
            display("line {}: {}", line, message)
        }
        Invalid(message: String) {
            description("invalid configuration")
            display("{}", message)
        }
    }
}

#[derive(Debug, Clone)]
pub struct LocationRule {
    pub prefix: String,
    pub root: PathBuf,
    pub index: Option<String>,
    pub upload_dir: Option<PathBuf>,
    pub cgi_extension: Option<String>,
    pub cgi_path: Option<PathBuf>,
    pub redirect: Option<(u16, String)>,
    pub autoindex: bool,
    pub methods: Vec<String>,
}

impl LocationRule {
    pub(crate) fn new(prefix: String) -> LocationRule {
        LocationRule {
            prefix,
            root: PathBuf::from("."),
            index: None,
            upload_dir: None,
            cgi_extension: None,
            cgi_path: None,
            redirect: None,
            autoindex: false,
            methods: vec!["GET".to_string()],
        }
    }

    fn validate(&self) -> Result<(), ConfigParseError> {
        if !self.prefix.starts_with('/') {
            return Err(ConfigParseError::Invalid(format!(
                "location prefix {:?} must begin with '/'",
                self.prefix
            )));
        }
        if self.cgi_extension.is_some() && self.cgi_path.is_none() {
            return Err(ConfigParseError::Invalid(format!(
                "location {:?}: cgi_extension set without cgi_path",
                self.prefix
            )));
        }
        if let Some((code, _)) = self.redirect {
            if !matches!(code, 301 | 302 | 303 | 307 | 308) {
                return Err(ConfigParseError::Invalid(format!(
                    "location {:?}: redirect status {} is not a valid redirect code",
                    self.prefix, code
                )));
            }
        }
        if self.upload_dir.is_some() && !self.methods.iter().any(|m| m == "POST") {
            return Err(ConfigParseError::Invalid(format!(
                "location {:?}: upload_dir set but POST is not a permitted method",
                self.prefix
            )));
        }
        Ok(())
    }

    pub fn matches(&self, path: &str) -> bool {
        if !path.starts_with(&self.prefix) {
            return false;
        }
        if self.prefix == "/" {
            return true;
        }
        match path.as_bytes().get(self.prefix.len()) {
            None => true,
            Some(b'/') => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerRule {
    pub host: String,
    pub port: u16,
    pub server_names: Vec<String>,
    pub error_pages: Vec<(u16, PathBuf)>,
    pub client_max_body_size: u64,
    pub locations: Vec<LocationRule>,
}

impl ServerRule {
    fn new() -> ServerRule {
        ServerRule {
            host: "0.0.0.0".to_string(),
            port: 8080,
            server_names: Vec::new(),
            error_pages: Vec::new(),
            client_max_body_size: 1024 * 1024,
            locations: Vec::new(),
        }
    }

    pub fn error_page_for(&self, code: u16) -> Option<&Path> {
        self.error_pages.iter().find(|(c, _)| *c == code).map(|(_, p)| p.as_path())
    }

    /// Longest-prefix match against this server's locations, ties broken
    /// by declaration order (first declared wins). `Iterator::max_by_key`
    /// keeps the *last* of equal-key elements, which is the wrong tiebreak
    /// here, so fold manually and only replace the current best on a
    /// strictly longer prefix.
    pub fn find_location(&self, path: &str) -> Option<&LocationRule> {
        let mut best: Option<&LocationRule> = None;
        for loc in &self.locations {
            if !loc.matches(path) {
                continue;
            }
            match best {
                Some(b) if loc.prefix.len() <= b.prefix.len() => {}
                _ => best = Some(loc),
            }
        }
        best
    }
}

/// Parse an nginx-like configuration file into a list of `ServerRule`s.
pub struct ConfigParser;

impl ConfigParser {
    pub fn load(path: &Path) -> Result<Vec<ServerRule>, ConfigParseError> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Vec<ServerRule>, ConfigParseError> {
        let tokens = tokenize(text);
        let mut cursor = Cursor { tokens: &tokens, pos: 0 };
        let mut servers = Vec::new();
        while cursor.peek().is_some() {
            cursor.expect_word("server")?;
            cursor.expect_symbol('{')?;
            servers.push(parse_server_block(&mut cursor)?);
        }
        if servers.is_empty() {
            return Err(ConfigParseError::Invalid("configuration defines no server blocks".to_string()));
        }
        Ok(servers)
    }
}

#[derive(Debug, Clone)]
struct Token {
    text: String,
    line: usize,
}

fn tokenize(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    for (line_idx, raw_line) in text.lines().enumerate() {
        let line_no = line_idx + 1;
        let line = match raw_line.find('#') {
            Some(p) => &raw_line[..p],
            None => raw_line,
        };
        let mut current = String::new();
        let flush = |current: &mut String, tokens: &mut Vec<Token>| {
            if !current.is_empty() {
                tokens.push(Token { text: std::mem::take(current), line: line_no });
            }
        };
        for ch in line.chars() {
            match ch {
                '{' | '}' | ';' => {
                    flush(&mut current, &mut tokens);
                    tokens.push(Token { text: ch.to_string(), line: line_no });
                }
                c if c.is_whitespace() => flush(&mut current, &mut tokens),
                c => current.push(c),
            }
        }
        flush(&mut current, &mut tokens);
    }
    tokens
}

struct Cursor<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&Token> {
        let tok = self.tokens.get(self.pos);
        self.pos += 1;
        tok
    }

    fn line(&self) -> usize {
        self.tokens.get(self.pos).or_else(|| self.tokens.last()).map(|t| t.line).unwrap_or(0)
    }

    fn expect_word(&mut self, word: &str) -> Result<(), ConfigParseError> {
        match self.next() {
            Some(t) if t.text == word => Ok(()),
            Some(t) => Err(ConfigParseError::Syntax(t.line, format!("expected '{}', found '{}'", word, t.text))),
            None => Err(ConfigParseError::Syntax(self.line(), format!("expected '{}', found end of file", word))),
        }
    }

    fn expect_symbol(&mut self, symbol: char) -> Result<(), ConfigParseError> {
        self.expect_word(&symbol.to_string())
    }

    fn expect_ident(&mut self) -> Result<String, ConfigParseError> {
        match self.next() {
            Some(t) if !matches!(t.text.as_str(), "{" | "}" | ";") => Ok(t.text.clone()),
            Some(t) => Err(ConfigParseError::Syntax(t.line, format!("expected a value, found '{}'", t.text))),
            None => Err(ConfigParseError::Syntax(self.line(), "expected a value, found end of file".to_string())),
        }
    }

    fn at_symbol(&self, symbol: char) -> bool {
        self.peek().map(|t| t.text == symbol.to_string()).unwrap_or(false)
    }
}

fn parse_server_block(cursor: &mut Cursor) -> Result<ServerRule, ConfigParseError> {
    let mut server = ServerRule::new();
    loop {
        if cursor.at_symbol('}') {
            cursor.next();
            break;
        }
        let directive = cursor.expect_ident()?;
        match directive.as_str() {
            "listen" => {
                let value = cursor.expect_ident()?;
                cursor.expect_symbol(';')?;
                match value.split_once(':') {
                    Some((host, port)) => {
                        server.host = host.to_string();
                        server.port = parse_port(port, cursor.line())?;
                    }
                    None => server.port = parse_port(&value, cursor.line())?,
                }
            }
            "server_name" => {
                loop {
                    if cursor.at_symbol(';') {
                        cursor.next();
                        break;
                    }
                    server.server_names.push(cursor.expect_ident()?);
                }
            }
            "error_page" => {
                let code = cursor.expect_ident()?;
                let path = cursor.expect_ident()?;
                cursor.expect_symbol(';')?;
                let code: u16 = code
                    .parse()
                    .map_err(|_| ConfigParseError::Syntax(cursor.line(), format!("invalid error_page code {:?}", code)))?;
                server.error_pages.push((code, PathBuf::from(path)));
            }
            "client_max_body_size" => {
                let value = cursor.expect_ident()?;
                cursor.expect_symbol(';')?;
                server.client_max_body_size = parse_size(&value, cursor.line())?;
            }
            "location" => {
                let prefix = cursor.expect_ident()?;
                cursor.expect_symbol('{')?;
                server.locations.push(parse_location_block(cursor, prefix)?);
            }
            other => {
                return Err(ConfigParseError::Syntax(cursor.line(), format!("unknown server directive '{}'", other)))
            }
        }
    }
    if server.locations.is_empty() {
        return Err(ConfigParseError::Invalid(format!(
            "server block on port {} defines no locations",
            server.port
        )));
    }
    Ok(server)
}

fn parse_location_block(cursor: &mut Cursor, prefix: String) -> Result<LocationRule, ConfigParseError> {
    let mut loc = LocationRule::new(prefix);
    let mut methods_set_explicitly = false;
    loop {
        if cursor.at_symbol('}') {
            cursor.next();
            break;
        }
        let directive = cursor.expect_ident()?;
        match directive.as_str() {
            "root" => {
                let value = cursor.expect_ident()?;
                cursor.expect_symbol(';')?;
                loc.root = PathBuf::from(value);
            }
            "index" => {
                let value = cursor.expect_ident()?;
                cursor.expect_symbol(';')?;
                loc.index = Some(value);
            }
            "upload_dir" => {
                let value = cursor.expect_ident()?;
                cursor.expect_symbol(';')?;
                loc.upload_dir = Some(PathBuf::from(value));
            }
            "cgi_extension" => {
                let value = cursor.expect_ident()?;
                cursor.expect_symbol(';')?;
                loc.cgi_extension = Some(value);
            }
            "cgi_path" => {
                let value = cursor.expect_ident()?;
                cursor.expect_symbol(';')?;
                loc.cgi_path = Some(PathBuf::from(value));
            }
            "autoindex" => {
                let value = cursor.expect_ident()?;
                cursor.expect_symbol(';')?;
                loc.autoindex = match value.as_str() {
                    "on" => true,
                    "off" => false,
                    other => {
                        return Err(ConfigParseError::Syntax(cursor.line(), format!("autoindex must be on|off, found '{}'", other)))
                    }
                };
            }
            "allow_methods" => {
                if !methods_set_explicitly {
                    loc.methods.clear();
                    methods_set_explicitly = true;
                }
                loop {
                    if cursor.at_symbol(';') {
                        cursor.next();
                        break;
                    }
                    loc.methods.push(cursor.expect_ident()?);
                }
            }
            "return" => {
                let code = cursor.expect_ident()?;
                let url = cursor.expect_ident()?;
                cursor.expect_symbol(';')?;
                let code: u16 = code
                    .parse()
                    .map_err(|_| ConfigParseError::Syntax(cursor.line(), format!("invalid redirect code {:?}", code)))?;
                loc.redirect = Some((code, url));
            }
            other => {
                return Err(ConfigParseError::Syntax(cursor.line(), format!("unknown location directive '{}'", other)))
            }
        }
    }
    loc.validate()?;
    Ok(loc)
}

fn parse_port(value: &str, line: usize) -> Result<u16, ConfigParseError> {
    value.parse().map_err(|_| ConfigParseError::Syntax(line, format!("invalid port {:?}", value)))
}

fn parse_size(value: &str, line: usize) -> Result<u64, ConfigParseError> {
    let value = value.trim();
    let (digits, multiplier) = match value.chars().last() {
        Some('K' | 'k') => (&value[..value.len() - 1], 1024),
        Some('M' | 'm') => (&value[..value.len() - 1], 1024 * 1024),
        Some('G' | 'g') => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        Some(_) => (value, 1),
        None => return Err(ConfigParseError::Syntax(line, "empty size value".to_string())),
    };
    let base: u64 = digits
        .parse()
        .map_err(|_| ConfigParseError::Syntax(line, format!("invalid size {:?}", value)))?;
    Ok(base * multiplier)
}

#[cfg(test)]
mod test {
    use super::*;

    const SAMPLE: &str = r#"
        server {
            listen 8080;
            server_name example.com www.example.com;
            client_max_body_size 1M;
            error_page 404 /errors/404.html;

            location / {
                root ./www;
                index index.html;
                allow_methods GET;
            }

            location /upload {
                root ./www;
                upload_dir ./uploads;
                allow_methods GET POST;
            }

            location /old {
                return 301 /new;
            }

            location /cgi-bin {
                root ./www/cgi-bin;
                cgi_extension .py;
                cgi_path /usr/bin/python3;
                allow_methods GET POST;
            }
        }
    "#;

    #[test]
    fn parses_full_server_block() {
        let servers = ConfigParser::parse(SAMPLE).unwrap();
        assert_eq!(servers.len(), 1);
        let server = &servers[0];
        assert_eq!(server.port, 8080);
        assert_eq!(server.server_names, vec!["example.com", "www.example.com"]);
        assert_eq!(server.client_max_body_size, 1024 * 1024);
        assert_eq!(server.error_page_for(404), Some(Path::new("/errors/404.html")));
        assert_eq!(server.locations.len(), 4);
    }

    #[test]
    fn longest_prefix_wins() {
        let servers = ConfigParser::parse(SAMPLE).unwrap();
        let server = &servers[0];
        let loc = server.find_location("/upload/file.txt").unwrap();
        assert_eq!(loc.prefix, "/upload");
    }

    #[test]
    fn equal_length_prefix_ties_favor_declaration_order() {
        let mut server = ServerRule::new();
        let mut first = LocationRule::new("/api".to_string());
        first.index = Some("first.html".to_string());
        let mut second = LocationRule::new("/api".to_string());
        second.index = Some("second.html".to_string());
        server.locations.push(first);
        server.locations.push(second);
        let loc = server.find_location("/api/x").unwrap();
        assert_eq!(loc.index.as_deref(), Some("first.html"));
    }

    #[test]
    fn prefix_boundary_respected() {
        let mut root = LocationRule::new("/api".to_string());
        root.methods = vec!["GET".to_string()];
        assert!(root.matches("/api"));
        assert!(root.matches("/api/x"));
        assert!(!root.matches("/api2/x"));
    }

    #[test]
    fn redirect_location_parsed() {
        let servers = ConfigParser::parse(SAMPLE).unwrap();
        let loc = servers[0].find_location("/old").unwrap();
        assert_eq!(loc.redirect, Some((301, "/new".to_string())));
    }

    #[test]
    fn cgi_without_path_is_rejected() {
        let bad = r#"
            server {
                listen 8080;
                location / {
                    root ./www;
                    cgi_extension .py;
                    allow_methods GET;
                }
            }
        "#;
        let err = ConfigParser::parse(bad).unwrap_err();
        assert!(matches!(err, ConfigParseError::Invalid(_)));
    }

    #[test]
    fn upload_dir_without_post_is_rejected() {
        let bad = r#"
            server {
                listen 8080;
                location / {
                    root ./www;
                    upload_dir ./uploads;
                    allow_methods GET;
                }
            }
        "#;
        let err = ConfigParser::parse(bad).unwrap_err();
        assert!(matches!(err, ConfigParseError::Invalid(_)));
    }

    #[test]
    fn unknown_directive_is_a_syntax_error() {
        let bad = r#"
            server {
                listen 8080;
                bogus_directive 1;
                location / { root ./www; }
            }
        "#;
        let err = ConfigParser::parse(bad).unwrap_err();
        assert!(matches!(err, ConfigParseError::Syntax(_, _)));
    }

    #[test]
    fn size_suffixes_are_parsed() {
        assert_eq!(parse_size("10", 1).unwrap(), 10);
        assert_eq!(parse_size("10K", 1).unwrap(), 10 * 1024);
        assert_eq!(parse_size("2M", 1).unwrap(), 2 * 1024 * 1024);
        assert_eq!(parse_size("1G", 1).unwrap(), 1024 * 1024 * 1024);
    }
}
