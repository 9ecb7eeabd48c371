use std::fmt::{self, Write};
use std::sync::Arc;

/// The identity of a cache entry.
///
/// A key is the string form of the arguments a value was requested with. Two different sets of
/// arguments producing the same string share a single entry, so a key should only contain the
/// parts that actually identify the value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(Arc<str>);

impl CacheKey {
    /// Creates a key out of the structural representation of `parts`.
    ///
    /// This is the default key derivation used when a loader does not provide its own.
    pub fn from_parts<K: KeyParts + ?Sized>(parts: &K) -> Self {
        let mut builder = CacheKeyBuilder::default();
        parts.write_parts(&mut builder);
        builder.build()
    }

    /// Creates a [`CacheKeyBuilder`] to assemble a key by hand.
    pub fn builder() -> CacheKeyBuilder {
        CacheKeyBuilder::default()
    }

    /// Returns the string form of this key.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(key: &str) -> Self {
        Self(key.into())
    }
}

impl From<String> for CacheKey {
    fn from(key: String) -> Self {
        Self(key.into())
    }
}

/// A builder for [`CacheKey`]s.
///
/// This builder implements the [`Write`](std::fmt::Write) trait, and the intention of it is to
/// accept human readable, but most importantly **stable**, input. Use [`push_part`](Self::push_part)
/// to append separated parts, or write into it directly for free-form keys.
#[derive(Debug, Default)]
pub struct CacheKeyBuilder {
    key: String,
    parts: usize,
}

impl CacheKeyBuilder {
    /// Appends one part to the key, separating it from the previous one.
    pub fn push_part(&mut self, part: impl fmt::Display) -> &mut Self {
        if self.parts > 0 {
            self.key.push(',');
        }
        self.parts += 1;
        // writing into a `String` never fails
        let _ = write!(self.key, "{part}");
        self
    }

    /// Finalize the [`CacheKey`].
    pub fn build(self) -> CacheKey {
        CacheKey(self.key.into())
    }
}

impl fmt::Write for CacheKeyBuilder {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.key.write_str(s)
    }
}

/// Types that can be structurally reduced to the parts of a [`CacheKey`].
///
/// Tuples are flattened, so `(a, (b, c))` produces the same key as `(a, b, c)`. Strings are
/// quoted so that a `,` inside of them can not be confused with a part separator.
pub trait KeyParts {
    /// Writes the parts of `self` into the builder.
    fn write_parts(&self, builder: &mut CacheKeyBuilder);
}

macro_rules! display_key_parts {
    ($($ty:ty),* $(,)?) => {
        $(
            impl KeyParts for $ty {
                fn write_parts(&self, builder: &mut CacheKeyBuilder) {
                    builder.push_part(self);
                }
            }
        )*
    };
}

display_key_parts!(
    u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, bool, char
);

impl KeyParts for str {
    fn write_parts(&self, builder: &mut CacheKeyBuilder) {
        builder.push_part(format_args!("{self:?}"));
    }
}

impl KeyParts for String {
    fn write_parts(&self, builder: &mut CacheKeyBuilder) {
        self.as_str().write_parts(builder);
    }
}

impl KeyParts for CacheKey {
    fn write_parts(&self, builder: &mut CacheKeyBuilder) {
        builder.push_part(self);
    }
}

impl KeyParts for () {
    fn write_parts(&self, _builder: &mut CacheKeyBuilder) {}
}

impl<T: KeyParts> KeyParts for Option<T> {
    fn write_parts(&self, builder: &mut CacheKeyBuilder) {
        match self {
            Some(inner) => inner.write_parts(builder),
            None => {
                builder.push_part("_");
            }
        }
    }
}

impl<T: KeyParts> KeyParts for [T] {
    fn write_parts(&self, builder: &mut CacheKeyBuilder) {
        let mut inner = CacheKeyBuilder::default();
        for item in self {
            item.write_parts(&mut inner);
        }
        builder.push_part(format_args!("[{}]", inner.key));
    }
}

impl<T: KeyParts> KeyParts for Vec<T> {
    fn write_parts(&self, builder: &mut CacheKeyBuilder) {
        self.as_slice().write_parts(builder);
    }
}

impl<T: KeyParts + ?Sized> KeyParts for &T {
    fn write_parts(&self, builder: &mut CacheKeyBuilder) {
        (**self).write_parts(builder);
    }
}

impl<T: KeyParts + ?Sized> KeyParts for Arc<T> {
    fn write_parts(&self, builder: &mut CacheKeyBuilder) {
        (**self).write_parts(builder);
    }
}

macro_rules! tuple_key_parts {
    ($($name:ident),+) => {
        impl<$($name: KeyParts),+> KeyParts for ($($name,)+) {
            #[allow(non_snake_case)]
            fn write_parts(&self, builder: &mut CacheKeyBuilder) {
                let ($($name,)+) = self;
                $($name.write_parts(builder);)+
            }
        }
    };
}

tuple_key_parts!(A);
tuple_key_parts!(A, B);
tuple_key_parts!(A, B, C);
tuple_key_parts!(A, B, C, D);
tuple_key_parts!(A, B, C, D, E);
tuple_key_parts!(A, B, C, D, E, F);
