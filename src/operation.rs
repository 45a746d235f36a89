use super::error::Result;
use super::flash::{AddressedBlock, PAGE_SIZE};
use super::session::BootloaderSession;
use super::transport::Transport;

/// A long-running operation which reports its progress as it goes.
///
/// Each step yields the number of bytes processed so far, out of [`total`]. The first error ends
/// the operation. To run it without looking at the progress, use [`execute`].
///
/// [`total`]: #tymethod.total
/// [`execute`]: #method.execute
pub trait Operation: Iterator<Item = Result<usize>> {
    fn total(&self) -> usize;

    fn execute(&mut self) -> Result<()> {
        if let Some(Err(error)) = self.last() {
            Err(error)
        } else {
            Ok(())
        }
    }
}

/// Programs a sequence of pages, one per step.
pub struct Program<'a, T: Transport, I> {
    session: &'a mut BootloaderSession<T>,
    pages: I,
    total: usize,
    programmed: usize,
    done: bool,
}

impl<T: Transport, I: Iterator<Item = AddressedBlock>> Operation for Program<'_, T, I> {
    fn total(&self) -> usize {
        self.total
    }
}

impl<T: Transport, I: Iterator<Item = AddressedBlock>> Iterator for Program<'_, T, I> {
    type Item = Result<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        if let Some(page) = self.pages.next() {
            Some(match self.session.program(&page) {
                Ok(()) => {
                    self.programmed += page.len();
                    Ok(self.programmed)
                }
                Err(error) => {
                    // Ensure that the iterator is fused after an error occurs
                    self.done = true;
                    Err(error)
                }
            })
        } else {
            self.done = true;
            None
        }
    }
}

impl<'a, T: Transport, I: ExactSizeIterator<Item = AddressedBlock>> Program<'a, T, I> {
    pub fn pages(session: &'a mut BootloaderSession<T>, pages: I) -> Self {
        Self {
            session,
            total: pages.len() * PAGE_SIZE as usize,
            done: pages.len() == 0,
            pages,
            programmed: 0,
        }
    }
}
