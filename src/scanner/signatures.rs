//! Static Signature Tier
//!
//! Fixed set of known-dangerous call signatures across Python, JavaScript
//! and shell. Any match is Critical. Deterministic and synchronous.

use once_cell::sync::Lazy;
use regex::Regex;

/// What a signature detects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureClass {
    ProcessSpawn,
    FileDeletion,
    DynamicEval,
    RawSocket,
    UnsafeDeserialization,
}

impl SignatureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignatureClass::ProcessSpawn => "process_spawn",
            SignatureClass::FileDeletion => "file_deletion",
            SignatureClass::DynamicEval => "dynamic_eval",
            SignatureClass::RawSocket => "raw_socket",
            SignatureClass::UnsafeDeserialization => "unsafe_deserialization",
        }
    }
}

/// One named signature
pub struct Signature {
    pub name: &'static str,
    pub class: SignatureClass,
    pattern: Regex,
}

/// A signature hit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureMatch {
    pub name: &'static str,
    pub class: SignatureClass,
    /// 1-based line of the first hit
    pub line: usize,
}

impl SignatureMatch {
    /// Finding text stored on the scan result
    pub fn describe(&self) -> String {
        format!("{}: {} (line {})", self.class.as_str(), self.name, self.line)
    }
}

fn sig(name: &'static str, class: SignatureClass, pattern: &str) -> Signature {
    Signature {
        name,
        class,
        // Patterns are compile-time constants covered by tests
        pattern: Regex::new(pattern).unwrap(),
    }
}

static SIGNATURES: Lazy<Vec<Signature>> = Lazy::new(|| {
    use SignatureClass::*;
    vec![
        // Raw process spawning
        sig("subprocess", ProcessSpawn, r"\bsubprocess\s*\.\s*(Popen|run|call|check_call|check_output|getoutput|getstatusoutput)\s*\("),
        sig("os.system", ProcessSpawn, r"\bos\s*\.\s*(system|popen|exec[lv]p?e?|spawn[lv]p?e?|posix_spawnp?|fork)\s*\("),
        sig("pty.spawn", ProcessSpawn, r"\bpty\s*\.\s*spawn\s*\("),
        sig("child_process", ProcessSpawn, r#"\bchild_process\b|require\s*\(\s*['"]child_process['"]\s*\)"#),
        sig("execSync/spawnSync", ProcessSpawn, r"\b(execSync|spawnSync|execFileSync)\s*\("),
        sig("shell pipe to interpreter", ProcessSpawn, r"\|\s*(ba|z|da)?sh\b"),
        // Direct file deletion
        sig("os.remove", FileDeletion, r"\bos\s*\.\s*(remove|unlink|rmdir|removedirs)\s*\("),
        sig("shutil.rmtree", FileDeletion, r"\bshutil\s*\.\s*rmtree\s*\("),
        sig("pathlib unlink", FileDeletion, r"\.\s*(unlink|rmdir)\s*\(\s*(missing_ok\s*=\s*\w+)?\s*\)"),
        sig("fs.unlink/rm", FileDeletion, r"\bfs\s*\.\s*(unlink|unlinkSync|rm|rmSync|rmdir|rmdirSync)\s*\("),
        sig("rm -rf", FileDeletion, r"\brm\s+-[a-zA-Z]*[rf][a-zA-Z]*\b"),
        // Dynamic code evaluation
        sig("eval", DynamicEval, r"(^|[^.\w])eval\s*\("),
        sig("exec", DynamicEval, r"(^|[^.\w])exec\s*\("),
        sig("compile", DynamicEval, r"(^|[^.\w])compile\s*\([^)]*['\x22](exec|eval)['\x22]"),
        sig("__import__", DynamicEval, r"\b__import__\s*\("),
        sig("new Function", DynamicEval, r"\bnew\s+Function\s*\("),
        sig("vm.runIn", DynamicEval, r"\bvm\s*\.\s*(runInNewContext|runInThisContext|runInContext|Script)\b"),
        sig("base64 to shell", DynamicEval, r"base64\s+(-d|--decode)\b"),
        // Low-level sockets
        sig("socket.socket", RawSocket, r"\bsocket\s*\.\s*(socket|create_connection|socketpair|fromfd)\s*\("),
        sig("net.Socket", RawSocket, r"\bnet\s*\.\s*(Socket|createConnection|connect|createServer)\s*\("),
        sig("dgram", RawSocket, r#"require\s*\(\s*['"](node:)?(net|dgram|tls)['"]\s*\)"#),
        sig("/dev/tcp", RawSocket, r"/dev/(tcp|udp)/"),
        sig("netcat", RawSocket, r"\b(nc|ncat|netcat|socat)\s+-"),
        // Arbitrary object deserialization
        sig("pickle", UnsafeDeserialization, r"\b(c?pickle|dill|shelve)\s*\.\s*(loads?|Unpickler|open)\s*\("),
        sig("marshal.loads", UnsafeDeserialization, r"\bmarshal\s*\.\s*loads?\s*\("),
        sig("yaml.load", UnsafeDeserialization, r"\byaml\s*\.\s*(load|unsafe_load|load_all|full_load)\s*\((?:[^)]*Loader\s*=\s*yaml\s*\.\s*(Unsafe|Full)?Loader|[^),]*\))"),
        sig("jsonpickle.decode", UnsafeDeserialization, r"\bjsonpickle\s*\.\s*decode\s*\("),
        sig("node-serialize", UnsafeDeserialization, r"\bunserialize\s*\("),
    ]
});

/// All compiled signatures
pub fn signatures() -> &'static [Signature] {
    &SIGNATURES
}

/// Match `source` against every signature; one hit per signature
pub fn scan(source: &str) -> Vec<SignatureMatch> {
    SIGNATURES
        .iter()
        .filter_map(|signature| {
            signature.pattern.find(source).map(|m| SignatureMatch {
                name: signature.name,
                class: signature.class,
                line: source[..m.start()].matches('\n').count() + 1,
            })
        })
        .collect()
}
