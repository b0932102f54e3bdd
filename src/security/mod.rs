mod secrets;

pub use secrets::SecretCipher;
