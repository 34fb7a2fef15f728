//! Calling a plain function with a decoded argument tuple.

/// A function that can be called with the slots of `Args` as positional
/// arguments.
///
/// Implemented for every `Fn` of arity 0 through 10 whose parameter list
/// matches the tuple. Closures passed where a `Callable` is expected need
/// their parameter types written out.
pub trait Callable<Args>: Send + Sync + 'static {
    type Output;

    fn call(&self, args: Args) -> Self::Output;
}

macro_rules! impl_callable {
    ($($name:ident)*) => {
        impl<Func, Out, $($name,)*> Callable<($($name,)*)> for Func
        where
            Func: Fn($($name),*) -> Out + Send + Sync + 'static,
        {
            type Output = Out;

            #[allow(non_snake_case)]
            #[inline]
            fn call(&self, ($($name,)*): ($($name,)*)) -> Out {
                (self)($($name),*)
            }
        }
    };
}

impl_callable!();
impl_callable!(A);
impl_callable!(A B);
impl_callable!(A B C);
impl_callable!(A B C D);
impl_callable!(A B C D E);
impl_callable!(A B C D E F);
impl_callable!(A B C D E F G);
impl_callable!(A B C D E F G H);
impl_callable!(A B C D E F G H I);
impl_callable!(A B C D E F G H I J);

#[cfg(test)]
mod tests {
    use super::*;

    fn invoke<Args, F: Callable<Args>>(f: &F, args: Args) -> F::Output {
        f.call(args)
    }

    fn sum(a: u8, b: u16, c: u32) -> u64 {
        a as u64 + b as u64 + c as u64
    }

    #[test]
    fn test_positional_call() {
        assert_eq!(invoke(&sum, (1u8, 2u16, 3u32)), 6);
        assert_eq!(invoke(&|| 5u8, ()), 5);
        assert_eq!(invoke(&|s: String| s.len(), (String::from("abc"),)), 3);
    }

    #[test]
    fn test_ten_arguments() {
        let f = |a: u8, b: u8, c: u8, d: u8, e: u8, f: u8, g: u8, h: u8, i: u8, j: u8| {
            [a, b, c, d, e, f, g, h, i, j].iter().map(|&x| x as u32).sum::<u32>()
        };
        assert_eq!(invoke(&f, (1, 2, 3, 4, 5, 6, 7, 8, 9, 10)), 55);
    }
}
